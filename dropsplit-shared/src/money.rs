//! Money is carried as integer minor units (`i64`). The platform's APIs speak
//! decimal strings ("12.50"), so conversion happens at the client boundary.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

const ZERO_DECIMAL_CURRENCIES: &[&str] = &[
    "BIF", "CLP", "DJF", "GNF", "ISK", "JPY", "KMF", "KRW", "PYG", "RWF", "UGX", "VND", "VUV", "XAF", "XOF", "XPF",
];

const THREE_DECIMAL_CURRENCIES: &[&str] = &["BHD", "IQD", "JOD", "KWD", "LYD", "OMR", "TND"];

/// Decimal places of one minor unit for an ISO 4217 code. Unlisted codes use two.
pub fn minor_unit_scale(currency: &str) -> u32 {
    let code = currency.trim().to_ascii_uppercase();
    if ZERO_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        0
    } else if THREE_DECIMAL_CURRENCIES.contains(&code.as_str()) {
        3
    } else {
        2
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Invalid decimal amount: {0}")]
    InvalidAmount(String),

    #[error("Amount out of range: {0}")]
    OutOfRange(String),
}

/// Parse a decimal string into minor units of `currency`, rounding half away from zero.
pub fn parse_minor_units(amount: &str, currency: &str) -> Result<i64, MoneyError> {
    let value = Decimal::from_str(amount.trim())
        .map_err(|_| MoneyError::InvalidAmount(amount.to_string()))?;

    let scaled = (value * Decimal::from(10_i64.pow(minor_unit_scale(currency))))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

    scaled
        .to_i64()
        .ok_or_else(|| MoneyError::OutOfRange(amount.to_string()))
}

/// Render minor units as a decimal string ("1250" USD -> "12.50").
pub fn format_minor_units(amount: i64, currency: &str) -> String {
    Decimal::new(amount, minor_unit_scale(currency)).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimal_strings() {
        assert_eq!(parse_minor_units("12.50", "USD").unwrap(), 1250);
        assert_eq!(parse_minor_units("0", "USD").unwrap(), 0);
        assert_eq!(parse_minor_units(" 7.005 ", "usd").unwrap(), 701);
        assert!(parse_minor_units("twelve", "USD").is_err());
    }

    #[test]
    fn test_format_minor_units() {
        assert_eq!(format_minor_units(1250, "USD"), "12.50");
        assert_eq!(format_minor_units(5, "EUR"), "0.05");
    }

    #[test]
    fn test_scale_follows_currency() {
        assert_eq!(parse_minor_units("1500", "JPY").unwrap(), 1500);
        assert_eq!(parse_minor_units("1.2345", "KWD").unwrap(), 1235);
        assert_eq!(format_minor_units(1500, "JPY"), "1500");
        assert_eq!(format_minor_units(1235, "KWD"), "1.235");
    }
}
