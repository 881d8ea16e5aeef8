//! # Enrichment orchestrator
//!
//! ## Responsibility
//! Drive the tier sequence for every region group and merge partial results
//! into one [`EnrichmentResult`]:
//!
//! ```text
//! keys by region
//!   └─► BatchQuery (≤ batch_limit keys, one request)
//!         └─► WorkerPool (bounded workers, each a SingleKeyQuery
//!               │         with retry and direct-protocol rescue)
//!               └─► static estimate for keys still in error
//! ```
//!
//! ## Guarantees
//! - Totality: every submitted key ends with exactly one classification
//! - Monotonic: a classification is only ever replaced by one of strictly
//!   higher confidence
//! - Skip mode never contacts the scoring service
//!
//! ## NOT Responsible For
//! - Transport and error categorisation (see: `scoring`)
//! - Price retrieval (see: `pricing`)

pub mod batch;
pub mod pool;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::EvictionClassification;
use crate::config::{CredentialSource, EnricherConfig};
use crate::estimate::estimate;
use crate::scoring::{
    AzureCliCredential, CredentialProvider, DirectProtocolClient, DirectScorer, EnvCredential,
    PlacementScoreClient, ScoringService,
};
use crate::{metrics, EnrichError, ScoreKey};

pub use batch::BatchQuery;
pub use pool::{PoolSettings, WorkerPool};
pub use retry::{QueryOutcome, RetryAction, RetryPolicy, RetryState, SingleKeyQuery};

/// Metric and export label for the neutral placeholder.
const NEUTRAL_SOURCE: &str = "neutral";

/// Classifications for every key of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentResult {
    entries: BTreeMap<ScoreKey, EvictionClassification>,
}

impl EnrichmentResult {
    /// Empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `classification` for `key`.
    ///
    /// An existing entry is replaced only when the new classification has
    /// strictly higher confidence. Returns `true` when the map changed.
    pub fn record(&mut self, key: ScoreKey, classification: EvictionClassification) -> bool {
        match self.entries.get(&key) {
            Some(existing) if existing.confidence() >= classification.confidence() => false,
            _ => {
                self.entries.insert(key, classification);
                true
            }
        }
    }

    /// Classification for `key`.
    pub fn get(&self, key: &ScoreKey) -> Option<&EvictionClassification> {
        self.entries.get(key)
    }

    /// Whether `key` has a classification.
    pub fn contains(&self, key: &ScoreKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of classified keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no key is classified.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ScoreKey, &EvictionClassification)> {
        self.entries.iter()
    }

    /// The underlying map.
    pub fn into_inner(self) -> BTreeMap<ScoreKey, EvictionClassification> {
        self.entries
    }

    /// Number of entries per source label (`live_score`, `neutral`, ...).
    pub fn tier_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for classification in self.entries.values() {
            *counts.entry(source_label(classification)).or_insert(0) += 1;
        }
        counts
    }
}

/// Source label of a classification for metrics and summaries.
pub fn source_label(classification: &EvictionClassification) -> &'static str {
    classification
        .source_tier()
        .map_or(NEUTRAL_SOURCE, |tier| tier.as_str())
}

struct Tiers {
    batch: BatchQuery,
    pool: WorkerPool,
}

/// Runs the tier sequence over region groups.
///
/// ## Example
///
/// ```no_run
/// use spot_enrich::config::EnricherConfig;
/// use spot_enrich::{Enricher, ScoreKey};
///
/// # async fn run() -> Result<(), spot_enrich::EnrichError> {
/// let enricher = Enricher::from_config(&EnricherConfig::default())?;
/// let result = enricher
///     .enrich_keys([ScoreKey::new("eastus", "Standard_D4s_v5")])
///     .await;
/// assert_eq!(result.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Enricher {
    tiers: Option<Tiers>,
    concurrency_limit: usize,
    static_fallback: bool,
}

impl Enricher {
    /// Build the tiers over the given scoring seams.
    ///
    /// `direct` enables the direct-protocol rescue inside single-key
    /// queries. With `enrichment.skip` set the enricher never calls either.
    pub fn new(
        service: Arc<dyn ScoringService>,
        direct: Option<Arc<dyn DirectScorer>>,
        config: &EnricherConfig,
    ) -> Self {
        if config.enrichment.skip {
            return Self::skipping(config);
        }

        let enrichment = &config.enrichment;
        let table = enrichment.bucket_table;
        let desired_count = config.scoring.desired_count;

        let mut query = SingleKeyQuery::new(
            Arc::clone(&service),
            RetryPolicy::from_config(enrichment, &config.backoff),
        )
        .with_table(table)
        .with_desired_count(desired_count);
        if let Some(direct) = direct.filter(|_| enrichment.direct_fallback) {
            query = query.with_direct(direct);
        }

        Self {
            tiers: Some(Tiers {
                batch: BatchQuery::new(service, enrichment.batch_limit, table, desired_count),
                pool: WorkerPool::new(Arc::new(query), PoolSettings::from_config(enrichment)),
            }),
            concurrency_limit: enrichment.concurrency_limit,
            static_fallback: enrichment.static_fallback,
        }
    }

    fn skipping(config: &EnricherConfig) -> Self {
        Self {
            tiers: None,
            concurrency_limit: config.enrichment.concurrency_limit,
            static_fallback: config.enrichment.static_fallback,
        }
    }

    /// Build the HTTP scoring clients described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`EnrichError::ScoringSetup`] when no subscription id is
    /// configured and enrichment is not skipped.
    pub fn from_config(config: &EnricherConfig) -> Result<Self, EnrichError> {
        if config.enrichment.skip {
            return Ok(Self::skipping(config));
        }

        let scoring = &config.scoring;
        let subscription_id = scoring.resolve_subscription_id().ok_or_else(|| {
            EnrichError::ScoringSetup(
                "no subscription id: set scoring.subscription_id or AZURE_SUBSCRIPTION_ID".into(),
            )
        })?;

        let credential: Arc<dyn CredentialProvider> = match scoring.credential {
            CredentialSource::AzureCli => Arc::new(AzureCliCredential::new()),
            CredentialSource::Env => Arc::new(EnvCredential::default()),
        };

        let client = PlacementScoreClient::new(subscription_id.clone(), Arc::clone(&credential))
            .with_endpoint(scoring.endpoint.clone())
            .with_api_version(scoring.api_version.clone())
            .with_timeout(scoring.request_timeout());

        let direct: Option<Arc<dyn DirectScorer>> = if config.enrichment.direct_fallback {
            Some(Arc::new(
                DirectProtocolClient::new(subscription_id, credential)
                    .with_endpoint(scoring.endpoint.clone())
                    .with_api_versions(scoring.direct_api_versions.iter().cloned())
                    .with_desired_count(scoring.desired_count)
                    .with_timeout(scoring.request_timeout()),
            ))
        } else {
            None
        };

        Ok(Self::new(Arc::new(client), direct, config))
    }

    /// `true` when enrichment is switched off.
    pub fn is_skipping(&self) -> bool {
        self.tiers.is_none()
    }

    /// Token that stops in-flight work when cancelled. `None` in skip mode.
    pub fn shutdown_token(&self) -> Option<CancellationToken> {
        self.tiers.as_ref().map(|tiers| tiers.pool.shutdown_token())
    }

    /// Classify every key of every region group.
    ///
    /// Regions run sequentially. Keys are deduplicated, both within a group
    /// and across groups.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn enrich(&self, grouped: &BTreeMap<String, Vec<ScoreKey>>) -> EnrichmentResult {
        let mut result = EnrichmentResult::new();

        let Some(tiers) = self.tiers.as_ref() else {
            for key in grouped.values().flatten() {
                result.record(key.clone(), EvictionClassification::neutral());
            }
            info!(keys = result.len(), "enrich: skipped, neutral classifications only");
            record_metrics(&result);
            return result;
        };

        for (region, keys) in grouped {
            let mut seen = BTreeSet::new();
            let keys: Vec<ScoreKey> = keys
                .iter()
                .filter(|key| !result.contains(key) && seen.insert((*key).clone()))
                .cloned()
                .collect();
            if keys.is_empty() {
                continue;
            }
            self.enrich_region(tiers, region, &keys, &mut result).await;
        }

        record_metrics(&result);
        result
    }

    /// Group a flat key list by region, then [`enrich`](Self::enrich) it.
    pub async fn enrich_keys<I>(&self, keys: I) -> EnrichmentResult
    where
        I: IntoIterator<Item = ScoreKey>,
    {
        let mut grouped: BTreeMap<String, Vec<ScoreKey>> = BTreeMap::new();
        for key in keys {
            grouped.entry(key.region.clone()).or_default().push(key);
        }
        self.enrich(&grouped).await
    }

    async fn enrich_region(
        &self,
        tiers: &Tiers,
        region: &str,
        keys: &[ScoreKey],
        result: &mut EnrichmentResult,
    ) {
        debug!(region, keys = keys.len(), "enrich: region start");

        if tiers.batch.accepts(keys.len()) {
            let cancel = tiers.pool.shutdown_token().child_token();
            for (key, classification) in tiers.batch.try_batch(region, keys, &cancel).await {
                result.record(key, classification);
            }
        }

        let remaining: Vec<ScoreKey> = keys
            .iter()
            .filter(|key| !result.contains(key))
            .cloned()
            .collect();
        if !remaining.is_empty() {
            let resolved = tiers
                .pool
                .resolve_batch(region, &remaining, self.concurrency_limit)
                .await;
            for (key, classification) in resolved {
                result.record(key, classification);
            }
        }

        let mut estimated = 0usize;
        for key in keys {
            let needs_fallback = result.get(key).map_or(true, |c| c.is_error());
            if !needs_fallback {
                continue;
            }
            if self.static_fallback || !result.contains(key) {
                result.record(key.clone(), estimate(&key.sku));
                estimated += 1;
            }
        }

        let scored = keys
            .iter()
            .filter(|key| result.get(key).is_some_and(|c| c.is_scored()))
            .count();
        let errors = keys
            .iter()
            .filter(|key| result.get(key).is_some_and(|c| c.is_error()))
            .count();
        if errors > 0 {
            warn!(region, errors, "enrich: keys left with error classifications");
        }
        info!(region, keys = keys.len(), scored, estimated, errors, "enrich: region done");
    }
}

fn record_metrics(result: &EnrichmentResult) {
    for (_, classification) in result.iter() {
        metrics::inc_classification(source_label(classification));
    }
}
