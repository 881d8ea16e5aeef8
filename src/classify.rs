//! Score classification.
//!
//! ## Responsibility
//! Turn a [`RawScoreLevel`] into a human-readable eviction-risk label and
//! probability bucket, and define the [`EvictionClassification`] value every
//! tier of the pipeline produces.
//!
//! ## Guarantees
//! - Deterministic and total: every level maps to exactly one pair
//! - Bucket strings live in one table per [`BucketTable`]; tiers never
//!   carry their own copies
//! - Classifications are immutable once built
//!
//! ## NOT Responsible For
//! - Core-count heuristics (that belongs to `estimate`)
//! - Deciding which tier wins for a key (that belongs to `enrich`)

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::scoring::ScoreErrorKind;
use crate::RawScoreLevel;

/// Label and bucket used when no classification is available.
pub const NOT_AVAILABLE: &str = "N/A";

/// Which probability-bucket table to render live scores with.
///
/// `Standard` is the canonical table. `Narrow` tightens the upper buckets
/// (`15-25%`, `>25%`) and, when selected, applies to every tier of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BucketTable {
    /// `15-30%` for Low, `30%+` for None.
    #[default]
    Standard,
    /// `15-25%` for Low, `>25%` for None.
    Narrow,
}

/// Which tier produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    /// Score returned by the primary scoring client.
    LiveScore,
    /// Score returned by the direct-protocol rescue.
    DirectProtocol,
    /// Heuristic estimate from the SKU's core count.
    StaticEstimate,
    /// Every tier failed; the label carries the failure kind.
    ErrorPlaceholder,
}

impl SourceTier {
    /// Relative confidence; higher wins when two tiers answer for one key.
    pub fn confidence(&self) -> u8 {
        match self {
            Self::LiveScore => 3,
            Self::DirectProtocol => 2,
            Self::StaticEstimate => 1,
            Self::ErrorPlaceholder => 0,
        }
    }

    /// Stable lowercase name, used for metric labels and exports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiveScore => "live_score",
            Self::DirectProtocol => "direct_protocol",
            Self::StaticEstimate => "static_estimate",
            Self::ErrorPlaceholder => "error_placeholder",
        }
    }
}

/// Map a raw score level to `(risk_label, percent_bucket)`.
///
/// # Panics
///
/// This function never panics.
pub fn classify(level: RawScoreLevel, table: BucketTable) -> (&'static str, &'static str) {
    match (level, table) {
        (RawScoreLevel::High, _) => ("Very Low", "0-5%"),
        (RawScoreLevel::Medium, _) => ("Low-Medium", "5-15%"),
        (RawScoreLevel::Low, BucketTable::Standard) => ("Medium-High", "15-30%"),
        (RawScoreLevel::Low, BucketTable::Narrow) => ("Medium-High", "15-25%"),
        (RawScoreLevel::None, BucketTable::Standard) => ("High", "30%+"),
        (RawScoreLevel::None, BucketTable::Narrow) => ("High", ">25%"),
        (RawScoreLevel::Unspecified, _) => (NOT_AVAILABLE, NOT_AVAILABLE),
    }
}

/// Eviction-risk classification for one key.
///
/// Built only through the constructors below, which keep `source_tier` and
/// `error_kind` consistent with the labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictionClassification {
    risk_label: String,
    percent_bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_tier: Option<SourceTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ScoreErrorKind>,
}

impl EvictionClassification {
    /// Classification of a score answered by `tier`.
    pub fn from_score(level: RawScoreLevel, table: BucketTable, tier: SourceTier) -> Self {
        let (risk_label, percent_bucket) = classify(level, table);
        Self {
            risk_label: risk_label.to_string(),
            percent_bucket: percent_bucket.to_string(),
            source_tier: Some(tier),
            error_kind: None,
        }
    }

    /// Heuristic classification; used by [`crate::estimate`].
    pub(crate) fn estimated(risk_label: &str, percent_bucket: &str) -> Self {
        Self {
            risk_label: risk_label.to_string(),
            percent_bucket: percent_bucket.to_string(),
            source_tier: Some(SourceTier::StaticEstimate),
            error_kind: None,
        }
    }

    /// Placeholder that surfaces the failure kind as both label and bucket.
    pub fn error_placeholder(kind: ScoreErrorKind) -> Self {
        Self {
            risk_label: kind.to_string(),
            percent_bucket: kind.to_string(),
            source_tier: Some(SourceTier::ErrorPlaceholder),
            error_kind: Some(kind),
        }
    }

    /// Neutral placeholder used when enrichment is switched off.
    pub fn neutral() -> Self {
        Self {
            risk_label: NOT_AVAILABLE.to_string(),
            percent_bucket: NOT_AVAILABLE.to_string(),
            source_tier: None,
            error_kind: None,
        }
    }

    /// Risk label, e.g. `Very Low`.
    pub fn risk_label(&self) -> &str {
        &self.risk_label
    }

    /// Probability bucket, e.g. `0-5%`.
    pub fn percent_bucket(&self) -> &str {
        &self.percent_bucket
    }

    /// Producing tier; `None` for the neutral placeholder.
    pub fn source_tier(&self) -> Option<SourceTier> {
        self.source_tier
    }

    /// Failure kind for error placeholders.
    pub fn error_kind(&self) -> Option<ScoreErrorKind> {
        self.error_kind
    }

    /// Confidence of the producing tier (0 for neutral).
    pub fn confidence(&self) -> u8 {
        self.source_tier.map_or(0, |tier| tier.confidence())
    }

    /// `true` for [`SourceTier::ErrorPlaceholder`].
    pub fn is_error(&self) -> bool {
        self.source_tier == Some(SourceTier::ErrorPlaceholder)
    }

    /// `true` when the classification came from an actual score.
    pub fn is_scored(&self) -> bool {
        matches!(
            self.source_tier,
            Some(SourceTier::LiveScore | SourceTier::DirectProtocol)
        )
    }
}
