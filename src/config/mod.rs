//! # Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that tunes the enrichment
//! pipeline, the scoring clients and price retrieval:
//! ```text
//! spot-enrich --config spot-enrich.toml
//! ```
//!
//! ## Guarantees
//! - Every field has a documented default; an empty file is a valid config
//! - A loaded config has passed every validation rule in [`validation`]
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building clients from config (that belongs to `enrich`)
//! - Command-line overrides (that belongs to the binary)

pub mod loader;
pub mod validation;

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::classify::BucketTable;
use crate::scoring::client::{DEFAULT_API_VERSION, DEFAULT_ENDPOINT};
use crate::scoring::direct::DEFAULT_API_VERSIONS;

// ── Default value functions ──────────────────────────────────────────────

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_direct_api_versions() -> Vec<String> {
    DEFAULT_API_VERSIONS.iter().map(|v| v.to_string()).collect()
}

/// Default `desiredCount` hint: 1 instance.
fn default_desired_count() -> u32 {
    1
}

/// Default per-request timeout: 30s.
fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Default batch tier limit: 5 keys, the service's practical cap.
fn default_batch_limit() -> usize {
    5
}

/// Default worker pool width: 2.
fn default_concurrency_limit() -> usize {
    2
}

/// Default retries after the first attempt: 4.
fn default_max_retries() -> u32 {
    4
}

/// Default direct-protocol checkpoint: the second failure.
fn default_direct_fallback_after() -> u32 {
    2
}

/// Default per-group timeout: 60s.
fn default_group_timeout_ms() -> u64 {
    60_000
}

/// Default maximum stagger before a worker starts: 800ms.
fn default_stagger_max_ms() -> u64 {
    800
}

/// Default pause between worker groups: 2s.
fn default_inter_group_pause_ms() -> u64 {
    2_000
}

/// Default final-sweep ceiling: 8 failing keys.
fn default_sweep_limit() -> usize {
    8
}

/// Default final-sweep attempts per key: 2.
fn default_sweep_attempts() -> u32 {
    2
}

/// Default final-sweep pause unit: 5s.
fn default_sweep_pause_ms() -> u64 {
    5_000
}

/// Default backoff base: 1s.
fn default_backoff_base_ms() -> u64 {
    1_000
}

/// Default backoff cap: 30s.
fn default_backoff_max_ms() -> u64 {
    30_000
}

/// Default jitter ceiling: 3s.
fn default_jitter_max_ms() -> u64 {
    3_000
}

fn default_pricing_endpoint() -> String {
    crate::pricing::retail::DEFAULT_ENDPOINT.to_string()
}

fn default_regions() -> Vec<String> {
    vec!["eastus".to_string()]
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Default page ceiling for price retrieval: 50.
fn default_max_pages() -> usize {
    50
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration.
///
/// # Example
///
/// ```toml
/// [scoring]
/// subscription_id = "00000000-0000-0000-0000-000000000000"
///
/// [enrichment]
/// concurrency_limit = 2
/// max_retries = 4
///
/// [pricing]
/// regions = ["eastus", "westeurope"]
/// sku_filters = ["D4s_v5", "E8s_v5"]
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnricherConfig {
    /// Scoring service connection.
    pub scoring: ScoringConfig,
    /// Tier behaviour of the enrichment pipeline.
    pub enrichment: EnrichmentConfig,
    /// Retry backoff shape.
    pub backoff: BackoffConfig,
    /// Retail price retrieval.
    pub pricing: PricingConfig,
    /// Logging.
    pub observability: ObservabilityConfig,
}

// ── Scoring ──────────────────────────────────────────────────────────────

/// How bearer tokens are obtained.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// `az account get-access-token`.
    #[default]
    AzureCli,
    /// `AZURE_ACCESS_TOKEN` environment variable.
    Env,
}

/// Scoring service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    /// Subscription to score against. Falls back to `AZURE_SUBSCRIPTION_ID`.
    pub subscription_id: Option<String>,
    /// Management endpoint.
    pub endpoint: String,
    /// API version for the primary client.
    pub api_version: String,
    /// API versions for the direct-protocol rescue, newest first.
    pub direct_api_versions: Vec<String>,
    /// `desiredCount` hint sent with every request.
    pub desired_count: u32,
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
    /// Token source.
    pub credential: CredentialSource,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            endpoint: default_endpoint(),
            api_version: default_api_version(),
            direct_api_versions: default_direct_api_versions(),
            desired_count: default_desired_count(),
            request_timeout_ms: default_request_timeout_ms(),
            credential: CredentialSource::default(),
        }
    }
}

impl ScoringConfig {
    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Configured subscription, else `AZURE_SUBSCRIPTION_ID`.
    pub fn resolve_subscription_id(&self) -> Option<String> {
        self.subscription_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| std::env::var("AZURE_SUBSCRIPTION_ID").ok())
            .filter(|id| !id.trim().is_empty())
    }
}

// ── Enrichment ───────────────────────────────────────────────────────────

/// Tier behaviour of the enrichment pipeline.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Skip scoring entirely; every key gets the neutral placeholder.
    pub skip: bool,
    /// Largest region group sent as one batch request. 0 disables batching.
    pub batch_limit: usize,
    /// Concurrent single-key workers per group.
    pub concurrency_limit: usize,
    /// Retries after the first attempt of a single-key query.
    pub max_retries: u32,
    /// Failure count at which the direct-protocol rescue runs.
    pub direct_fallback_after: u32,
    /// Whether the direct-protocol rescue is used at all.
    pub direct_fallback: bool,
    /// Time limit for one worker group (ms).
    pub group_timeout_ms: u64,
    /// Upper bound of the random start delay per worker (ms).
    pub stagger_max_ms: u64,
    /// Pause between worker groups (ms).
    pub inter_group_pause_ms: u64,
    /// Final sweep runs only when at most this many keys are failing.
    pub sweep_limit: usize,
    /// Attempts per failing key in the final sweep.
    pub sweep_attempts: u32,
    /// Pause unit before each sweep attempt (ms); multiplied by the attempt.
    pub sweep_pause_ms: u64,
    /// Replace remaining error placeholders with static estimates.
    pub static_fallback: bool,
    /// Bucket table used for every scored classification.
    pub bucket_table: BucketTable,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            skip: false,
            batch_limit: default_batch_limit(),
            concurrency_limit: default_concurrency_limit(),
            max_retries: default_max_retries(),
            direct_fallback_after: default_direct_fallback_after(),
            direct_fallback: default_true(),
            group_timeout_ms: default_group_timeout_ms(),
            stagger_max_ms: default_stagger_max_ms(),
            inter_group_pause_ms: default_inter_group_pause_ms(),
            sweep_limit: default_sweep_limit(),
            sweep_attempts: default_sweep_attempts(),
            sweep_pause_ms: default_sweep_pause_ms(),
            static_fallback: default_true(),
            bucket_table: BucketTable::default(),
        }
    }
}

// ── Backoff ──────────────────────────────────────────────────────────────

/// Exponential backoff with additive jitter.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure (ms). Must be ≤ `max_ms`.
    pub base_ms: u64,
    /// Delay cap (ms).
    pub max_ms: u64,
    /// Uniform random jitter added to each delay, `[0, jitter_max_ms]`.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

// ── Pricing ──────────────────────────────────────────────────────────────

/// Retail price retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// Retail prices API endpoint.
    pub endpoint: String,
    /// ARM regions to price.
    pub regions: Vec<String>,
    /// Case-insensitive substrings; a SKU must contain one. Empty keeps all.
    pub sku_filters: Vec<String>,
    /// ISO currency code.
    pub currency: String,
    /// Page ceiling per region.
    pub max_pages: usize,
    /// Per-request timeout (ms).
    pub request_timeout_ms: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            endpoint: default_pricing_endpoint(),
            regions: default_regions(),
            sku_filters: Vec::new(),
            currency: default_currency(),
            max_pages: default_max_pages(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` overrides it.
    pub log_format: LogFormat,
}

/// Log output format.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for [`EnricherConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(EnricherConfig);
    serde_json::to_string_pretty(&schema)
}
