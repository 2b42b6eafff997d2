use dropsplit_core::cache::EstimateCache;
use dropsplit_core::commerce::{CartLine, CommerceError, CommercePlatform, DeliveryOption};
use dropsplit_core::directory::{DirectoryError, PartnerDirectory};
use dropsplit_shared::models::rates::{RateRequest, RateResponse, ShippingRate};
use dropsplit_shared::models::Address;
use futures_util::future::join_all;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("Supplier store {0} is not registered")]
    UnknownSupplier(Uuid),

    #[error(transparent)]
    Commerce(#[from] CommerceError),

    #[error("Supplier estimate timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivery options from one supplier's storefront.
#[derive(Debug, Clone, PartialEq)]
pub struct SupplierEstimate {
    pub supplier_id: Uuid,
    pub options: Vec<DeliveryOption>,
}

/// Lowercased, with runs of non-alphanumerics collapsed to `_`.
/// "Express (2-Day)" -> "express_2_day".
pub fn normalize_service_code(name: &str) -> String {
    let mut code = String::with_capacity(name.len());
    let mut pending_sep = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !code.is_empty() {
                code.push('_');
            }
            pending_sep = false;
            code.push(ch.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }

    code
}

/// Pick the option the buyer chose, falling back to the cheapest.
pub fn select_option<'a>(options: &'a [DeliveryOption], service_code: &str) -> Option<&'a DeliveryOption> {
    let wanted = normalize_service_code(service_code);
    options
        .iter()
        .find(|o| normalize_service_code(&o.title) == wanted || normalize_service_code(&o.code) == wanted)
        .or_else(|| options.iter().min_by_key(|o| o.amount))
}

/// Merge per-supplier estimates into one rate list.
///
/// Every service any supplier offers becomes an option. Its price is the sum
/// over suppliers of that supplier's price for the service, or of the
/// supplier's cheapest option when it does not offer the service.
pub fn blend(estimates: &[SupplierEstimate], currency: &str) -> Vec<ShippingRate> {
    let usable: Vec<&SupplierEstimate> = estimates.iter().filter(|e| !e.options.is_empty()).collect();
    if usable.is_empty() {
        return Vec::new();
    }

    // Per supplier: normalized code -> cheapest matching option.
    let per_supplier: Vec<BTreeMap<String, &DeliveryOption>> = usable
        .iter()
        .map(|estimate| {
            let mut by_code: BTreeMap<String, &DeliveryOption> = BTreeMap::new();
            for option in &estimate.options {
                let code = normalize_service_code(&option.title);
                match by_code.get(&code) {
                    Some(existing) if existing.amount <= option.amount => {}
                    _ => {
                        by_code.insert(code, option);
                    }
                }
            }
            by_code
        })
        .collect();

    let mut services: Vec<(String, String)> = Vec::new();
    for estimate in &usable {
        for option in &estimate.options {
            let code = normalize_service_code(&option.title);
            if !services.iter().any(|(c, _)| *c == code) {
                services.push((code, option.title.clone()));
            }
        }
    }

    let supplier_count = usable.len();
    let mut rates: Vec<(i64, ShippingRate)> = services
        .into_iter()
        .map(|(code, title)| {
            let mut total = 0i64;
            let mut offered_by = 0usize;
            for by_code in &per_supplier {
                match by_code.get(&code) {
                    Some(option) => {
                        total += option.amount;
                        offered_by += 1;
                    }
                    None => total += by_code.values().map(|o| o.amount).min().unwrap_or(0),
                }
            }

            let description = if supplier_count > 1 {
                Some(if offered_by == supplier_count {
                    format!("Ships in {} packages", supplier_count)
                } else {
                    format!("Ships in {} packages, some by the cheapest available service", supplier_count)
                })
            } else {
                None
            };

            (
                total,
                ShippingRate {
                    service_name: title,
                    service_code: code,
                    total_price: total.to_string(),
                    currency: currency.to_string(),
                    description,
                },
            )
        })
        .collect();

    rates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.service_code.cmp(&b.1.service_code)));
    rates.into_iter().map(|(_, rate)| rate).collect()
}

/// Digest of everything that changes a supplier's estimate.
fn cache_key(supplier_id: Uuid, lines: &[CartLine], destination: &Address, currency: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(supplier_id.as_bytes());
    hasher.update(currency.as_bytes());
    for part in [&destination.country, &destination.province, &destination.city, &destination.postal_code] {
        hasher.update(part.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
    }
    for line in lines {
        hasher.update(format!("{}x{};", line.variant_id, line.quantity).as_bytes());
    }
    format!("{}:{}", supplier_id, hex::encode(hasher.finalize()))
}

// ============================================================================
// Quoter
// ============================================================================

pub struct CarrierRateQuoter {
    directory: Arc<dyn PartnerDirectory>,
    commerce: Arc<dyn CommercePlatform>,
    cache: Option<Arc<dyn EstimateCache>>,
    supplier_timeout: Duration,
}

impl CarrierRateQuoter {
    pub fn new(
        directory: Arc<dyn PartnerDirectory>,
        commerce: Arc<dyn CommercePlatform>,
        supplier_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            commerce,
            cache: None,
            supplier_timeout,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn EstimateCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Never fails: any error yields the empty response so checkout falls back
    /// to the platform's own rates.
    pub async fn quote(&self, retailer_shop: &str, request: &RateRequest) -> RateResponse {
        match self.try_quote(retailer_shop, request).await {
            Ok(rates) => RateResponse { rates },
            Err(e) => {
                warn!(shop = retailer_shop, error = %e, "Rate quote failed, deferring to platform rates");
                RateResponse::empty()
            }
        }
    }

    async fn try_quote(&self, retailer_shop: &str, request: &RateRequest) -> Result<Vec<ShippingRate>, QuoteError> {
        let Some(retailer) = self.directory.store_by_domain(retailer_shop).await? else {
            debug!(shop = retailer_shop, "Rate request from unknown store");
            return Ok(Vec::new());
        };

        let variant_ids: Vec<String> = request
            .items
            .iter()
            .filter(|i| i.requires_shipping)
            .map(|i| i.variant_id.clone())
            .collect();

        if !self.directory.has_imported_variants(retailer.id, &variant_ids).await? {
            return Ok(Vec::new());
        }

        let imported = self.directory.imported_variants(retailer.id, &variant_ids).await?;

        let mut carts: BTreeMap<Uuid, Vec<CartLine>> = BTreeMap::new();
        for item in request.items.iter().filter(|i| i.requires_shipping) {
            if let Some(variant) = imported.iter().find(|v| v.retailer_variant_id == item.variant_id) {
                carts.entry(variant.supplier_id).or_default().push(CartLine {
                    variant_id: variant.supplier_variant_id.clone(),
                    quantity: item.quantity,
                });
            }
        }

        let lookups = carts
            .iter()
            .map(|(supplier_id, lines)| self.supplier_estimate(*supplier_id, lines, &request.destination, &request.currency));
        let results = join_all(lookups).await;

        let mut estimates = Vec::new();
        for (supplier_id, result) in carts.keys().zip(results) {
            match result {
                Ok(options) => estimates.push(SupplierEstimate {
                    supplier_id: *supplier_id,
                    options,
                }),
                Err(e) => warn!(supplier_id = %supplier_id, error = %e, "Excluding supplier from quote"),
            }
        }

        let rates = blend(&estimates, &request.currency);
        info!(
            shop = retailer_shop,
            suppliers = carts.len(),
            responded = estimates.len(),
            rates = rates.len(),
            "Blended carrier rates"
        );
        Ok(rates)
    }

    /// One supplier's estimate, bounded by the per-supplier timeout.
    pub async fn supplier_estimate(
        &self,
        supplier_id: Uuid,
        lines: &[CartLine],
        destination: &Address,
        currency: &str,
    ) -> Result<Vec<DeliveryOption>, QuoteError> {
        let key = cache_key(supplier_id, lines, destination, currency);
        if let Some(cache) = &self.cache {
            if let Some(options) = cache.get(&key).await {
                return Ok(options);
            }
        }

        let supplier = self
            .directory
            .store_by_id(supplier_id)
            .await?
            .ok_or(QuoteError::UnknownSupplier(supplier_id))?;

        let handle = supplier.handle();
        let lookup = self.commerce.delivery_options(&handle, lines, destination, currency);
        let options = tokio::time::timeout(self.supplier_timeout, lookup)
            .await
            .map_err(|_| QuoteError::Timeout(self.supplier_timeout))??;

        if let Some(cache) = &self.cache {
            cache.put(&key, &options).await;
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn option(title: &str, amount: i64) -> DeliveryOption {
        DeliveryOption {
            title: title.into(),
            code: title.to_uppercase(),
            amount,
            currency: "USD".into(),
        }
    }

    #[test]
    fn test_normalize_service_code() {
        assert_eq!(normalize_service_code("Express (2-Day)"), "express_2_day");
        assert_eq!(normalize_service_code("  Standard  "), "standard");
        assert_eq!(normalize_service_code("standard"), "standard");
    }

    #[test]
    fn test_select_option_falls_back_to_cheapest() {
        let options = vec![option("Express", 1800), option("Economy", 400), option("Standard", 700)];
        assert_eq!(select_option(&options, "standard").unwrap().title, "Standard");
        assert_eq!(select_option(&options, "overnight").unwrap().title, "Economy");
        assert!(select_option(&[], "standard").is_none());
    }

    #[test]
    fn test_blend_sums_shared_services() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let estimates = vec![
            SupplierEstimate { supplier_id: a, options: vec![option("Standard", 500), option("Express", 1500)] },
            SupplierEstimate { supplier_id: b, options: vec![option("Standard", 700)] },
        ];

        let rates = blend(&estimates, "USD");

        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].service_code, "standard");
        assert_eq!(rates[0].total_price, "1200");
        // Supplier b has no express; its cheapest (standard) fills in.
        assert_eq!(rates[1].service_code, "express");
        assert_eq!(rates[1].total_price, "2200");
        assert!(rates[1].description.as_deref().unwrap().contains("cheapest available"));
    }

    #[test]
    fn test_blend_single_supplier_passes_through() {
        let estimates = vec![SupplierEstimate {
            supplier_id: Uuid::new_v4(),
            options: vec![option("Standard", 500)],
        }];
        let rates = blend(&estimates, "CAD");
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].currency, "CAD");
        assert!(rates[0].description.is_none());
    }

    #[test]
    fn test_blend_with_no_estimates_is_empty() {
        assert!(blend(&[], "USD").is_empty());
        let empty = vec![SupplierEstimate { supplier_id: Uuid::new_v4(), options: vec![] }];
        assert!(blend(&empty, "USD").is_empty());
    }

    mod quoting {
        use super::super::*;
        use crate::testing::{delivery_option, imported_fixture, store_fixture, FakeCommerce};
        use async_trait::async_trait;
        use dropsplit_core::directory::PartnerRole;
        use dropsplit_shared::models::rates::RateItem;
        use dropsplit_store::InMemoryDirectory;
        use std::sync::Mutex;

        #[derive(Default)]
        struct MapCache {
            entries: Mutex<BTreeMap<String, Vec<DeliveryOption>>>,
        }

        #[async_trait]
        impl EstimateCache for MapCache {
            async fn get(&self, key: &str) -> Option<Vec<DeliveryOption>> {
                self.entries.lock().unwrap().get(key).cloned()
            }

            async fn put(&self, key: &str, options: &[DeliveryOption]) {
                self.entries.lock().unwrap().insert(key.to_string(), options.to_vec());
            }
        }

        fn item(variant_id: &str, quantity: u32) -> RateItem {
            RateItem {
                variant_id: variant_id.into(),
                quantity,
                name: None,
                grams: 500,
                price: 2500,
                requires_shipping: true,
            }
        }

        fn request(items: Vec<RateItem>) -> RateRequest {
            RateRequest {
                origin: Address::default(),
                destination: Address {
                    country: Some("US".into()),
                    postal_code: Some("94107".into()),
                    ..Default::default()
                },
                items,
                currency: "USD".into(),
                locale: None,
            }
        }

        fn setup(supplier_timeout: Duration) -> (Arc<FakeCommerce>, CarrierRateQuoter) {
            let directory = Arc::new(InMemoryDirectory::new());
            let commerce = Arc::new(FakeCommerce::new());

            let retailer = store_fixture("retailer.example.com", PartnerRole::Retailer);
            let s1 = store_fixture("s1.example.com", PartnerRole::Supplier);
            let s2 = store_fixture("s2.example.com", PartnerRole::Supplier);
            for store in [&retailer, &s1, &s2] {
                directory.add_store(store.clone());
            }
            directory.add_imported_variant(retailer.id, imported_fixture(s1.id, "rv-a", "sv-a"));
            directory.add_imported_variant(retailer.id, imported_fixture(s2.id, "rv-b", "sv-b"));

            commerce.set_delivery_options(
                "s1.example.com",
                vec![delivery_option("Standard", 500), delivery_option("Express", 1500)],
            );
            commerce.set_delivery_options("s2.example.com", vec![delivery_option("Standard", 700)]);

            let quoter = CarrierRateQuoter::new(directory, commerce.clone(), supplier_timeout);
            (commerce, quoter)
        }

        #[tokio::test]
        async fn test_cart_without_imported_variants_gets_no_rates() {
            let (commerce, quoter) = setup(Duration::from_secs(2));

            let response = quoter
                .quote("retailer.example.com", &request(vec![item("rv-native", 1)]))
                .await;

            assert!(response.rates.is_empty());
            assert_eq!(commerce.delivery_lookups(), 0);
        }

        #[tokio::test]
        async fn test_unknown_store_gets_no_rates() {
            let (_, quoter) = setup(Duration::from_secs(2));
            let response = quoter.quote("stranger.example.com", &request(vec![item("rv-a", 1)])).await;
            assert!(response.rates.is_empty());
        }

        #[tokio::test]
        async fn test_rates_blend_across_suppliers() {
            let (_, quoter) = setup(Duration::from_secs(2));

            let response = quoter
                .quote(
                    "retailer.example.com",
                    &request(vec![item("rv-a", 2), item("rv-b", 1), item("rv-native", 1)]),
                )
                .await;

            let codes: Vec<&str> = response.rates.iter().map(|r| r.service_code.as_str()).collect();
            assert_eq!(codes, vec!["standard", "express"]);
            assert_eq!(response.rates[0].total_price, "1200");
            assert_eq!(response.rates[1].total_price, "2200");
        }

        #[tokio::test]
        async fn test_slow_supplier_is_left_out() {
            let (commerce, quoter) = setup(Duration::from_millis(50));
            commerce.set_delay("s2.example.com", Duration::from_millis(500));

            let response = quoter
                .quote("retailer.example.com", &request(vec![item("rv-a", 1), item("rv-b", 1)]))
                .await;

            assert_eq!(response.rates.len(), 2);
            assert_eq!(response.rates[0].total_price, "500");
            assert!(response.rates[0].description.is_none());
        }

        #[tokio::test]
        async fn test_failing_supplier_is_left_out() {
            let (commerce, quoter) = setup(Duration::from_secs(2));
            commerce.fail_shop("s1.example.com");

            let response = quoter
                .quote("retailer.example.com", &request(vec![item("rv-a", 1), item("rv-b", 1)]))
                .await;

            assert_eq!(response.rates.len(), 1);
            assert_eq!(response.rates[0].total_price, "700");
        }

        #[tokio::test]
        async fn test_cached_estimates_skip_the_platform() {
            let (commerce, quoter) = setup(Duration::from_secs(2));
            let quoter = quoter.with_cache(Arc::new(MapCache::default()));
            let cart = request(vec![item("rv-a", 1)]);

            let first = quoter.quote("retailer.example.com", &cart).await;
            let second = quoter.quote("retailer.example.com", &cart).await;

            assert_eq!(first, second);
            assert_eq!(commerce.delivery_lookups(), 1);
        }
    }
}
