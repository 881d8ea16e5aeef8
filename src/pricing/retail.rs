//! Retail prices API client.
//!
//! Pages through the public, unauthenticated retail prices API following
//! `NextPageLink`, one region at a time.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{matches_filters, PriceRecord, PricingError};
use crate::config::PricingConfig;

/// Public retail prices endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://prices.azure.com/api/retail/prices";

/// One page of the retail prices API.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PricePage {
    /// Records on this page.
    pub items: Vec<PriceRecord>,
    /// Absolute URL of the next page, absent on the last one.
    pub next_page_link: Option<String>,
}

/// Paginating retail price client.
pub struct RetailPriceClient {
    http: reqwest::Client,
    endpoint: String,
    currency: String,
    max_pages: usize,
    timeout: Duration,
}

impl RetailPriceClient {
    /// Client for the public endpoint, USD prices.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            currency: "USD".to_string(),
            max_pages: 50,
            timeout: Duration::from_secs(30),
        }
    }

    /// Client described by the `[pricing]` section.
    pub fn from_config(config: &PricingConfig) -> Self {
        Self::new()
            .with_endpoint(config.endpoint.clone())
            .with_currency(config.currency.clone())
            .with_max_pages(config.max_pages)
            .with_timeout(Duration::from_millis(config.request_timeout_ms))
    }

    /// Override the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// ISO currency code of returned prices.
    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Page ceiling per region.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// OData filter for consumption VM prices in `region`.
    pub fn region_filter(region: &str) -> String {
        format!(
            "serviceName eq 'Virtual Machines' and priceType eq 'Consumption' and armRegionName eq '{region}'"
        )
    }

    /// Every record of `region` whose SKU matches `sku_filters`.
    ///
    /// # Errors
    ///
    /// Returns [`PricingError`] when a page cannot be fetched or decoded.
    pub async fn fetch_region(
        &self,
        region: &str,
        sku_filters: &[String],
    ) -> Result<Vec<PriceRecord>, PricingError> {
        let mut records = Vec::new();
        let mut page_count = 0usize;

        let first = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("currencyCode", format!("'{}'", self.currency)),
                ("$filter", Self::region_filter(region)),
            ]);
        let mut page = self.fetch_page(first).await?;

        loop {
            page_count += 1;
            let fetched = page.items.len();
            records.extend(
                page.items
                    .into_iter()
                    .filter(|r| matches_filters(&r.arm_sku_name, sku_filters)),
            );
            debug!(region, page = page_count, fetched, kept = records.len(), "pricing: page");

            let Some(next) = page.next_page_link.filter(|link| !link.is_empty()) else {
                break;
            };
            if page_count >= self.max_pages {
                warn!(region, max_pages = self.max_pages, "pricing: page limit reached, truncating");
                break;
            }
            page = self.fetch_page(self.http.get(&next)).await?;
        }

        info!(region, records = records.len(), pages = page_count, "pricing: region fetched");
        Ok(records)
    }

    /// Records of every region, in region order.
    ///
    /// # Errors
    ///
    /// Returns the first [`PricingError`] encountered.
    pub async fn fetch_all(
        &self,
        regions: &[String],
        sku_filters: &[String],
    ) -> Result<Vec<PriceRecord>, PricingError> {
        let mut records = Vec::new();
        for region in regions {
            records.extend(self.fetch_region(region.trim(), sku_filters).await?);
        }
        Ok(records)
    }

    async fn fetch_page(&self, request: reqwest::RequestBuilder) -> Result<PricePage, PricingError> {
        let response = request.timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PricingError::Status {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| PricingError::Decode(e.to_string()))
    }
}

impl Default for RetailPriceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_filter_names_region() {
        let filter = RetailPriceClient::region_filter("westeurope");
        assert!(filter.contains("armRegionName eq 'westeurope'"));
        assert!(filter.starts_with("serviceName eq 'Virtual Machines'"));
    }

    #[test]
    fn test_price_page_decodes_pascal_case() {
        let body = r#"{
            "BillingCurrency": "USD",
            "Items": [{"armSkuName": "Standard_D2s_v5", "retailPrice": 0.02}],
            "NextPageLink": null,
            "Count": 1
        }"#;
        let page: PricePage = serde_json::from_str(body).expect("test: decode");
        assert_eq!(page.items.len(), 1);
        assert!(page.next_page_link.is_none());
    }

    #[test]
    fn test_from_config_uses_configured_values() {
        let config = PricingConfig {
            max_pages: 3,
            currency: "EUR".into(),
            ..PricingConfig::default()
        };
        let client = RetailPriceClient::from_config(&config);
        assert_eq!(client.max_pages, 3);
        assert_eq!(client.currency, "EUR");
        assert_eq!(client.endpoint, DEFAULT_ENDPOINT);
    }
}
