//! Webhook signature checks for both inbound sources.
//!
//! The commerce platform signs the raw body with HMAC-SHA256 and sends the
//! digest base64-encoded. The payment processor signs `"{t}.{body}"` and sends
//! `t=<unix seconds>,v1=<hex digest>`, possibly with several `v1` entries
//! while a secret is being rolled.

use base64::prelude::*;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header missing")]
    MissingHeader,

    #[error("Signature header malformed")]
    Malformed,

    #[error("Signature timestamp outside tolerance")]
    Expired,

    #[error("Signature mismatch")]
    Mismatch,
}

fn keyed_mac(secret: &str) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)
}

pub fn verify_platform_hmac(body: &[u8], secret: &str, header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;
    let expected = BASE64_STANDARD
        .decode(header.trim())
        .map_err(|_| SignatureError::Malformed)?;

    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    // verify_slice compares in constant time
    mac.verify_slice(&expected).map_err(|_| SignatureError::Mismatch)
}

pub fn sign_platform_body(body: &[u8], secret: &str) -> Result<String, SignatureError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    Ok(BASE64_STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn verify_processor_signature(
    body: &[u8],
    secret: &str,
    header: Option<&str>,
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::MissingHeader)?;

    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        let (key, value) = part.split_once('=').ok_or(SignatureError::Malformed)?;
        match key.trim() {
            "t" => {
                let t = value.trim().parse::<i64>().map_err(|_| SignatureError::Malformed)?;
                timestamp = Some(t);
            }
            "v1" => candidates.push(value.trim()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if candidates.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > tolerance_seconds {
        return Err(SignatureError::Expired);
    }

    for candidate in candidates {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = keyed_mac(secret)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Builds a header value in the processor's format.
pub fn sign_processor_payload(body: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())))
}
