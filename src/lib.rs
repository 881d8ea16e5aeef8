//! # spot-enrich
//!
//! Spot VM pricing enriched with eviction-risk classifications derived from
//! the provider's spot placement scores.
//!
//! ## Architecture
//!
//! Tiered enrichment per region, most accurate first:
//! ```text
//! ScoreKeys ─► Batch query (≤5 keys) ─► Worker pool (retry + direct rescue) ─► Static estimate
//! ```
//!
//! Every submitted key leaves the pipeline with exactly one
//! [`classify::EvictionClassification`]; scoring failures never abort a run.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod classify;
pub mod config;
pub mod enrich;
pub mod estimate;
pub mod metrics;
pub mod pricing;
pub mod report;
pub mod scoring;

// Re-exports for convenience
pub use classify::{classify, BucketTable, EvictionClassification, SourceTier};
pub use enrich::{EnrichmentResult, Enricher};
pub use estimate::estimate;
pub use scoring::{ScoreError, ScoreErrorKind, ScoringService};

use config::LogFormat;

/// Initialise the global tracing subscriber.
///
/// The `LOG_FORMAT` environment variable, when set, overrides the configured
/// format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else: human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=spot_enrich=debug`).
///
/// # Errors
///
/// Returns [`EnrichError::Other`] if the global subscriber has already been
/// set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing(configured: &LogFormat) -> Result<(), EnrichError> {
    let json = match std::env::var("LOG_FORMAT") {
        Ok(value) => value == "json",
        Err(_) => *configured == LogFormat::Json,
    };

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init()
    };

    result.map_err(|e| EnrichError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors.
///
/// Only failures that end a run surface here: configuration problems and
/// price retrieval. Scoring failures are absorbed into classifications.
#[derive(Error, Debug)]
pub enum EnrichError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] config::validation::ConfigError),

    /// Retail price retrieval failed.
    #[error(transparent)]
    Pricing(#[from] pricing::PricingError),

    /// A scoring client could not be constructed.
    #[error("scoring setup failed: {0}")]
    ScoringSetup(String),

    /// Writing an export file failed.
    #[error("export to {path} failed: {source}")]
    Export {
        /// Destination path.
        path: String,
        /// Underlying I/O or serialization error.
        #[source]
        source: std::io::Error,
    },

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Identity of one lookup: a SKU in a region.
///
/// Ordering is region first, then SKU, so result maps iterate in a stable,
/// display-friendly order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScoreKey {
    /// ARM region name, e.g. `eastus`.
    pub region: String,
    /// ARM SKU name, e.g. `Standard_D4s_v5`.
    pub sku: String,
}

impl ScoreKey {
    /// Create a new [`ScoreKey`].
    pub fn new(region: impl Into<String>, sku: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            sku: sku.into(),
        }
    }
}

impl fmt::Display for ScoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.sku)
    }
}

/// Coarse placement score returned by the scoring service.
///
/// Any score string the service sends that is not one of the four known
/// levels (e.g. `DataNotFoundOrStale`) maps to [`RawScoreLevel::Unspecified`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RawScoreLevel {
    /// Ample capacity; eviction unlikely.
    High,
    /// Moderate capacity.
    Medium,
    /// Constrained capacity.
    Low,
    /// No capacity signal; eviction likely.
    None,
    /// Unknown or restricted.
    Unspecified,
}

impl RawScoreLevel {
    /// Wire name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
            Self::None => "None",
            Self::Unspecified => "Unspecified",
        }
    }
}

impl From<&str> for RawScoreLevel {
    fn from(value: &str) -> Self {
        match value.trim() {
            "High" => Self::High,
            "Medium" => Self::Medium,
            "Low" => Self::Low,
            "None" => Self::None,
            _ => Self::Unspecified,
        }
    }
}

impl From<String> for RawScoreLevel {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<RawScoreLevel> for String {
    fn from(value: RawScoreLevel) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RawScoreLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_score_level_parses_known_levels() {
        assert_eq!(RawScoreLevel::from("High"), RawScoreLevel::High);
        assert_eq!(RawScoreLevel::from("Medium"), RawScoreLevel::Medium);
        assert_eq!(RawScoreLevel::from("Low"), RawScoreLevel::Low);
        assert_eq!(RawScoreLevel::from("None"), RawScoreLevel::None);
    }

    #[test]
    fn test_raw_score_level_unknown_string_is_unspecified() {
        assert_eq!(
            RawScoreLevel::from("DataNotFoundOrStale"),
            RawScoreLevel::Unspecified
        );
        assert_eq!(RawScoreLevel::from(""), RawScoreLevel::Unspecified);
    }

    #[test]
    fn test_raw_score_level_deserializes_from_json_string() {
        let level: RawScoreLevel = serde_json::from_str("\"Medium\"").expect("test: decode");
        assert_eq!(level, RawScoreLevel::Medium);
        let level: RawScoreLevel =
            serde_json::from_str("\"RestrictedSkuNotAvailable\"").expect("test: decode");
        assert_eq!(level, RawScoreLevel::Unspecified);
    }

    #[test]
    fn test_score_key_orders_by_region_then_sku() {
        let a = ScoreKey::new("eastus", "Standard_D8s_v5");
        let b = ScoreKey::new("eastus", "Standard_E2s_v5");
        let c = ScoreKey::new("westus", "Standard_A1");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_score_key_display() {
        let key = ScoreKey::new("eastus", "Standard_D2s_v5");
        assert_eq!(key.to_string(), "eastus/Standard_D2s_v5");
    }
}
