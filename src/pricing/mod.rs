//! # Retail pricing
//!
//! ## Responsibility
//! Turn raw retail price records into one [`PricingRow`] per
//! `(region, sku, os)` with its spot and pay-as-you-go hourly prices, and
//! derive the [`ScoreKey`]s the enrichment pipeline classifies.
//!
//! ## Guarantees
//! - Rows are sorted by region, SKU, OS
//! - Every row has a positive spot price
//! - Each price is the minimum positive hourly price of its kind
//!
//! ## NOT Responsible For
//! - Eviction classification (see: `enrich`)
//! - Rendering (see: `report`)

pub mod retail;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ScoreKey;

pub use retail::RetailPriceClient;

/// Unit of measure of hourly prices.
pub const HOURLY_UNIT: &str = "1 Hour";

/// Errors from retail price retrieval.
#[derive(Debug, Error)]
pub enum PricingError {
    /// The HTTP request could not be sent or its body not read.
    #[error("retail price request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("retail price API returned {status} for {url}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Requested URL.
        url: String,
    },

    /// The response body was not a price page.
    #[error("unexpected retail price response: {0}")]
    Decode(String),
}

/// One record of the retail prices API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceRecord {
    /// ARM SKU name, e.g. `Standard_D4s_v5`.
    pub arm_sku_name: String,
    /// ARM region name, e.g. `eastus`.
    pub arm_region_name: String,
    /// Product, e.g. `Virtual Machines Dsv5 Series Windows`.
    pub product_name: String,
    /// Meter, e.g. `D4s v5 Spot`.
    pub meter_name: String,
    /// SKU display name, e.g. `D4s v5 Low Priority`.
    pub sku_name: String,
    /// Billing unit, e.g. `1 Hour`.
    pub unit_of_measure: String,
    /// Price per unit.
    pub retail_price: f64,
    /// Price type, e.g. `Consumption`.
    #[serde(rename = "type")]
    pub price_type: String,
}

/// Price kind of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriceKind {
    /// Preemptible spot price.
    Spot,
    /// Standard pay-as-you-go price.
    PayAsYouGo,
}

impl PriceRecord {
    /// Spot, pay-as-you-go, or neither (low priority, reservations).
    pub fn kind(&self) -> Option<PriceKind> {
        if !self.price_type.is_empty() && self.price_type != "Consumption" {
            return None;
        }
        let names = [self.meter_name.as_str(), self.sku_name.as_str()];
        if names.iter().any(|n| n.contains("Spot")) {
            Some(PriceKind::Spot)
        } else if names.iter().any(|n| n.contains("Low Priority")) {
            None
        } else {
            Some(PriceKind::PayAsYouGo)
        }
    }

    /// Operating system the price applies to.
    pub fn os(&self) -> OperatingSystem {
        if self.product_name.contains("Windows") {
            OperatingSystem::Windows
        } else {
            OperatingSystem::Linux
        }
    }

    /// Whether the price is billed per hour.
    pub fn is_hourly(&self) -> bool {
        self.unit_of_measure.trim() == HOURLY_UNIT
    }
}

/// Operating system of a price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperatingSystem {
    /// Linux (the default when the product does not name Windows).
    Linux,
    /// Windows.
    Windows,
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => f.write_str("Linux"),
            Self::Windows => f.write_str("Windows"),
        }
    }
}

/// Hourly spot and pay-as-you-go price of one SKU and OS in one region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricingRow {
    /// ARM region name.
    pub region: String,
    /// ARM SKU name.
    pub sku: String,
    /// Operating system.
    pub os: OperatingSystem,
    /// Lowest spot price.
    pub spot_price: f64,
    /// Lowest pay-as-you-go price, when listed.
    pub payg_price: Option<f64>,
}

impl PricingRow {
    /// Key the enrichment pipeline classifies this row under.
    pub fn score_key(&self) -> ScoreKey {
        ScoreKey::new(self.region.clone(), self.sku.clone())
    }

    /// Savings of spot over pay-as-you-go, e.g. `70.0%`.
    pub fn savings(&self) -> String {
        savings_percent(self.payg_price, Some(self.spot_price))
    }
}

/// Join raw records into pricing rows.
///
/// Records that are not hourly, have no SKU or region, are neither spot nor
/// pay-as-you-go, or carry a non-positive price are ignored. Rows without
/// a spot price are dropped.
///
/// # Panics
///
/// This function never panics.
pub fn join_records<'a, I>(records: I) -> Vec<PricingRow>
where
    I: IntoIterator<Item = &'a PriceRecord>,
{
    type Slot = (Option<f64>, Option<f64>);
    let mut joined: BTreeMap<(String, String, OperatingSystem), Slot> = BTreeMap::new();

    for record in records {
        if !record.is_hourly()
            || record.arm_sku_name.is_empty()
            || record.arm_region_name.is_empty()
            || !(record.retail_price > 0.0)
        {
            continue;
        }
        let Some(kind) = record.kind() else {
            continue;
        };

        let slot = joined
            .entry((
                record.arm_region_name.clone(),
                record.arm_sku_name.clone(),
                record.os(),
            ))
            .or_default();
        let price = match kind {
            PriceKind::Spot => &mut slot.0,
            PriceKind::PayAsYouGo => &mut slot.1,
        };
        *price = Some(price.map_or(record.retail_price, |p| p.min(record.retail_price)));
    }

    joined
        .into_iter()
        .filter_map(|((region, sku, os), (spot, payg))| {
            spot.map(|spot_price| PricingRow {
                region,
                sku,
                os,
                spot_price,
                payg_price: payg,
            })
        })
        .collect()
}

/// Spot savings over pay-as-you-go with one decimal, e.g. `70.0%`.
///
/// `N/A` when either price is missing or `payg <= 0`.
pub fn savings_percent(payg: Option<f64>, spot: Option<f64>) -> String {
    match (payg, spot) {
        (Some(payg), Some(spot)) if payg > 0.0 => {
            format!("{:.1}%", (payg - spot) / payg * 100.0)
        }
        _ => crate::classify::NOT_AVAILABLE.to_string(),
    }
}

/// Distinct score keys per region, in row order.
pub fn group_keys(rows: &[PricingRow]) -> BTreeMap<String, Vec<ScoreKey>> {
    let mut grouped: BTreeMap<String, Vec<ScoreKey>> = BTreeMap::new();
    for row in rows {
        let keys = grouped.entry(row.region.clone()).or_default();
        if !keys.iter().any(|k| k.sku == row.sku) {
            keys.push(row.score_key());
        }
    }
    grouped
}

/// Whether `sku` contains one of `filters` (case-insensitive). An empty
/// filter list matches everything.
pub fn matches_filters(sku: &str, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let sku = sku.to_ascii_lowercase();
    filters
        .iter()
        .any(|f| sku.contains(&f.trim().to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(sku: &str, product: &str, meter: &str, price: f64) -> PriceRecord {
        PriceRecord {
            arm_sku_name: sku.into(),
            arm_region_name: "eastus".into(),
            product_name: product.into(),
            meter_name: meter.into(),
            sku_name: meter.into(),
            unit_of_measure: HOURLY_UNIT.into(),
            retail_price: price,
            price_type: "Consumption".into(),
        }
    }

    #[test]
    fn test_savings_seventy_percent() {
        assert_eq!(savings_percent(Some(1.00), Some(0.30)), "70.0%");
    }

    #[test]
    fn test_savings_missing_price_is_not_available() {
        assert_eq!(savings_percent(None, Some(0.30)), "N/A");
        assert_eq!(savings_percent(Some(1.0), None), "N/A");
        assert_eq!(savings_percent(Some(0.0), Some(0.30)), "N/A");
    }

    #[test]
    fn test_record_kind_detection() {
        let spot = record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.05);
        let low = record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Low Priority", 0.04);
        let payg = record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5", 0.19);
        assert_eq!(spot.kind(), Some(PriceKind::Spot));
        assert_eq!(low.kind(), None);
        assert_eq!(payg.kind(), Some(PriceKind::PayAsYouGo));
    }

    #[test]
    fn test_reservation_records_are_ignored() {
        let mut r = record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5", 900.0);
        r.price_type = "Reservation".into();
        assert_eq!(r.kind(), None);
    }

    #[test]
    fn test_join_pairs_spot_and_payg_per_os() {
        let records = vec![
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.05),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5", 0.19),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series Windows", "D4s v5 Spot", 0.09),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series Windows", "D4s v5", 0.37),
        ];

        let rows = join_records(&records);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].os, OperatingSystem::Linux);
        assert_eq!(rows[0].spot_price, 0.05);
        assert_eq!(rows[0].payg_price, Some(0.19));
        assert_eq!(rows[1].os, OperatingSystem::Windows);
        assert_eq!(rows[1].payg_price, Some(0.37));
    }

    #[test]
    fn test_join_keeps_minimum_positive_price() {
        let records = vec![
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.07),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.05),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.0),
        ];
        let rows = join_records(&records);
        assert_eq!(rows[0].spot_price, 0.05);
        assert_eq!(rows[0].payg_price, None);
    }

    #[test]
    fn test_join_drops_rows_without_spot_and_non_hourly() {
        let mut monthly = record("Standard_D2s_v5", "Virtual Machines Dsv5 Series", "D2s v5 Spot", 30.0);
        monthly.unit_of_measure = "1/Month".into();
        let records = vec![
            record("Standard_D8s_v5", "Virtual Machines Dsv5 Series", "D8s v5", 0.38),
            monthly,
        ];
        assert!(join_records(&records).is_empty());
    }

    #[test]
    fn test_join_sorts_by_region_sku_os() {
        let mut west = record("Standard_A2_v2", "Virtual Machines Av2 Series", "A2 v2 Spot", 0.01);
        west.arm_region_name = "westus".into();
        let records = vec![
            west,
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.05),
            record("Standard_A2_v2", "Virtual Machines Av2 Series", "A2 v2 Spot", 0.01),
        ];
        let rows = join_records(&records);
        let order: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.region.as_str(), r.sku.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("eastus", "Standard_A2_v2"),
                ("eastus", "Standard_D4s_v5"),
                ("westus", "Standard_A2_v2"),
            ]
        );
    }

    #[test]
    fn test_group_keys_dedupes_os_variants() {
        let records = vec![
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series", "D4s v5 Spot", 0.05),
            record("Standard_D4s_v5", "Virtual Machines Dsv5 Series Windows", "D4s v5 Spot", 0.09),
        ];
        let grouped = group_keys(&join_records(&records));
        assert_eq!(grouped["eastus"], vec![ScoreKey::new("eastus", "Standard_D4s_v5")]);
    }

    #[test]
    fn test_matches_filters_case_insensitive() {
        let filters = vec!["d4S_V5".to_string()];
        assert!(matches_filters("Standard_D4s_v5", &filters));
        assert!(!matches_filters("Standard_E4s_v5", &filters));
        assert!(matches_filters("anything", &[]));
    }

    #[test]
    fn test_price_record_deserializes_api_field_names() {
        let json = r#"{
            "currencyCode": "USD",
            "retailPrice": 0.0456,
            "armRegionName": "eastus",
            "productName": "Virtual Machines Dsv5 Series",
            "skuName": "D4s v5 Spot",
            "meterName": "D4s v5 Spot",
            "armSkuName": "Standard_D4s_v5",
            "unitOfMeasure": "1 Hour",
            "type": "Consumption"
        }"#;
        let r: PriceRecord = serde_json::from_str(json).expect("test: decode");
        assert_eq!(r.arm_sku_name, "Standard_D4s_v5");
        assert_eq!(r.kind(), Some(PriceKind::Spot));
        assert!(r.is_hourly());
    }
}
