//! Bounded-concurrency worker pool for single-key queries.
//!
//! ## Responsibility
//! Fan the keys of one region out over at most `concurrency_limit`
//! concurrent [`SingleKeyQuery`] workers, one group at a time, and give
//! every key a classification even when a group overruns its deadline.
//!
//! ## Guarantees
//! - At most `concurrency_limit` workers run at any instant; groups are
//!   sequential
//! - Workers return values; only the pool loop writes the result map
//! - A group that overruns `group_timeout` is cancelled and aborted; its
//!   silent keys become `Timeout` placeholders
//! - Every key passed in appears in the returned map
//!
//! ## NOT Responsible For
//! - Static fallback (that belongs to the orchestrator)
//! - Batch requests (see: `batch`)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{QueryOutcome, SingleKeyQuery};
use crate::classify::EvictionClassification;
use crate::config::EnrichmentConfig;
use crate::scoring::{ScoreError, ScoreErrorKind};
use crate::ScoreKey;

/// Timing knobs of the pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    /// Retries per key after the first attempt.
    pub max_retries: u32,
    /// Deadline for one group.
    pub group_timeout: Duration,
    /// Upper bound of the random start delay per worker.
    pub stagger_max: Duration,
    /// Pause between groups.
    pub inter_group_pause: Duration,
    /// Final sweep runs only when at most this many keys are failing.
    pub sweep_limit: usize,
    /// Attempts per failing key in the final sweep.
    pub sweep_attempts: u32,
    /// Pause unit before each sweep attempt.
    pub sweep_pause: Duration,
}

impl PoolSettings {
    /// Settings described by the `[enrichment]` section.
    pub fn from_config(config: &EnrichmentConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            group_timeout: Duration::from_millis(config.group_timeout_ms),
            stagger_max: Duration::from_millis(config.stagger_max_ms),
            inter_group_pause: Duration::from_millis(config.inter_group_pause_ms),
            sweep_limit: config.sweep_limit,
            sweep_attempts: config.sweep_attempts,
            sweep_pause: Duration::from_millis(config.sweep_pause_ms),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&EnrichmentConfig::default())
    }
}

/// Worker pool over a shared [`SingleKeyQuery`].
pub struct WorkerPool {
    query: Arc<SingleKeyQuery>,
    settings: PoolSettings,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Create a pool.
    pub fn new(query: Arc<SingleKeyQuery>, settings: PoolSettings) -> Self {
        Self {
            query,
            settings,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token whose cancellation stops every group and sweep of this pool.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Pool settings.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Resolve `keys` of `region` with at most `concurrency_limit` workers
    /// in flight.
    ///
    /// Keys that exhaust their retries come back as error placeholders
    /// carrying the failure kind.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn resolve_batch(
        &self,
        region: &str,
        keys: &[ScoreKey],
        concurrency_limit: usize,
    ) -> BTreeMap<ScoreKey, EvictionClassification> {
        let mut results = BTreeMap::new();
        let width = concurrency_limit.max(1);

        for (index, group) in keys.chunks(width).enumerate() {
            if index > 0 && !pause(self.settings.inter_group_pause, &self.shutdown).await {
                break;
            }
            debug!(region, group = index, keys = group.len(), "pool: starting group");
            self.run_group(group, &mut results).await;
        }

        // Keys never started because the pool was shut down.
        for key in keys {
            results
                .entry(key.clone())
                .or_insert_with(|| EvictionClassification::error_placeholder(ScoreErrorKind::Timeout));
        }

        self.final_sweep(region, &mut results).await;

        let failing = results.values().filter(|c| c.is_error()).count();
        info!(region, keys = keys.len(), failing, "pool: region resolved");
        results
    }

    async fn run_group(
        &self,
        group: &[ScoreKey],
        results: &mut BTreeMap<ScoreKey, EvictionClassification>,
    ) {
        let token = self.shutdown.child_token();
        let mut set = JoinSet::new();

        for key in group {
            let key = key.clone();
            let query = Arc::clone(&self.query);
            let worker_token = token.child_token();
            let max_retries = self.settings.max_retries;
            let stagger = random_stagger(self.settings.stagger_max);

            set.spawn(async move {
                if !pause(stagger, &worker_token).await {
                    let outcome = QueryOutcome::Exhausted {
                        last_error: ScoreError::cancelled(),
                        attempts: 0,
                    };
                    return (key, outcome);
                }
                let outcome = query.query_with_retry(&key, max_retries, &worker_token).await;
                (key, outcome)
            });
        }

        let deadline = tokio::time::sleep(self.settings.group_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((key, outcome))) => {
                        let classification = SingleKeyQuery::resolve(&key, outcome, false);
                        results.insert(key, classification);
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "pool: worker task failed");
                    }
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(
                timeout_ms = self.settings.group_timeout.as_millis() as u64,
                pending = set.len(),
                "pool: group timed out, cancelling stragglers"
            );
            token.cancel();
            set.shutdown().await;
        }

        let missing_kind = if timed_out {
            ScoreErrorKind::Timeout
        } else {
            ScoreErrorKind::ApiFailed
        };
        for key in group {
            results
                .entry(key.clone())
                .or_insert_with(|| EvictionClassification::error_placeholder(missing_kind));
        }
    }

    /// Sequential second pass over a small number of failing keys.
    async fn final_sweep(
        &self,
        region: &str,
        results: &mut BTreeMap<ScoreKey, EvictionClassification>,
    ) {
        let failing: Vec<ScoreKey> = results
            .iter()
            .filter(|(_, c)| c.is_error())
            .map(|(key, _)| key.clone())
            .collect();

        if failing.is_empty() || failing.len() > self.settings.sweep_limit {
            if !failing.is_empty() {
                debug!(region, failing = failing.len(), "pool: too many failures for a sweep");
            }
            return;
        }

        info!(region, failing = failing.len(), "pool: final sweep");

        for key in failing {
            for attempt in 1..=self.settings.sweep_attempts {
                let wait = self.settings.sweep_pause.saturating_mul(attempt);
                if !pause(wait, &self.shutdown).await {
                    return;
                }

                let token = self.shutdown.child_token();
                let outcome = match tokio::time::timeout(
                    self.settings.group_timeout,
                    self.query.query_with_retry(&key, 0, &token),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        token.cancel();
                        QueryOutcome::Exhausted {
                            last_error: ScoreError::new(
                                ScoreErrorKind::Timeout,
                                "sweep attempt timed out",
                            ),
                            attempts: 1,
                        }
                    }
                };

                let succeeded = matches!(outcome, QueryOutcome::Succeeded(_));
                let classification = SingleKeyQuery::resolve(&key, outcome, false);
                results.insert(key.clone(), classification);
                if succeeded {
                    debug!(key = %key, attempt, "pool: sweep recovered key");
                    break;
                }
            }
        }
    }
}

fn random_stagger(max: Duration) -> Duration {
    let ceiling = max.as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}

/// Sleep for `duration` unless `cancel` fires first. Returns `false` when
/// cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::SourceTier;
    use crate::enrich::retry::RetryPolicy;
    use crate::scoring::{PlacementRequest, ScoringService};
    use crate::RawScoreLevel;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers High after `delay`, failing the first `failures[sku]` calls
    /// per SKU.
    struct Scripted {
        delay: Duration,
        failures: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                failures: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(self, sku: &str, times: usize) -> Self {
            self.failures
                .lock()
                .expect("test: lock")
                .insert(sku.to_string(), times);
            self
        }
    }

    #[async_trait]
    impl ScoringService for Scripted {
        async fn score(
            &self,
            request: &PlacementRequest,
            cancel: &CancellationToken,
        ) -> Result<Vec<RawScoreLevel>, ScoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = tokio::select! {
                _ = cancel.cancelled() => Err(ScoreError::cancelled()),
                _ = tokio::time::sleep(self.delay) => {
                    let sku = request.desired_sizes[0].sku.clone();
                    let mut failures = self.failures.lock().expect("test: lock");
                    match failures.get_mut(&sku) {
                        Some(left) if *left > 0 => {
                            *left -= 1;
                            Err(ScoreError::new(ScoreErrorKind::RateLimited, "429"))
                        }
                        _ => Ok(vec![RawScoreLevel::High]),
                    }
                }
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn fast_settings() -> PoolSettings {
        PoolSettings {
            max_retries: 0,
            group_timeout: Duration::from_secs(5),
            stagger_max: Duration::from_millis(5),
            inter_group_pause: Duration::ZERO,
            sweep_limit: 8,
            sweep_attempts: 2,
            sweep_pause: Duration::ZERO,
        }
    }

    fn pool(service: Arc<Scripted>, settings: PoolSettings) -> WorkerPool {
        let query = SingleKeyQuery::new(service, RetryPolicy::immediate());
        WorkerPool::new(Arc::new(query), settings)
    }

    fn keys(n: usize) -> Vec<ScoreKey> {
        (0..n)
            .map(|i| ScoreKey::new("eastus", format!("Standard_D{}s_v5", i + 2)))
            .collect()
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_concurrency_limit() {
        let service = Arc::new(Scripted::new(Duration::from_millis(20)));
        let pool = pool(service.clone(), fast_settings());

        let result = pool.resolve_batch("eastus", &keys(5), 2).await;

        assert_eq!(result.len(), 5);
        assert!(service.peak.load(Ordering::SeqCst) <= 2);
        assert!(result.values().all(|c| c.source_tier() == Some(SourceTier::LiveScore)));
    }

    #[tokio::test]
    async fn test_pool_group_timeout_yields_timeout_placeholders() {
        let service = Arc::new(Scripted::new(Duration::from_secs(30)));
        let settings = PoolSettings {
            group_timeout: Duration::from_millis(50),
            sweep_limit: 0,
            ..fast_settings()
        };
        let pool = pool(service, settings);
        let keys = keys(3);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pool.resolve_batch("eastus", &keys, 2),
        )
        .await
        .expect("test: timed-out groups must not hang the pool");

        assert_eq!(result.len(), 3);
        for key in &keys {
            assert_eq!(result[key].error_kind(), Some(ScoreErrorKind::Timeout));
        }
    }

    #[tokio::test]
    async fn test_pool_sweep_recovers_failing_key() {
        let service = Arc::new(
            Scripted::new(Duration::from_millis(1)).failing("Standard_D2s_v5", 1),
        );
        let pool = pool(service, fast_settings());
        let keys = keys(2);

        let result = pool.resolve_batch("eastus", &keys, 2).await;

        assert_eq!(result[&keys[0]].source_tier(), Some(SourceTier::LiveScore));
        assert_eq!(result[&keys[1]].source_tier(), Some(SourceTier::LiveScore));
    }

    #[tokio::test]
    async fn test_pool_skips_sweep_above_limit() {
        let service = Arc::new(
            Scripted::new(Duration::from_millis(1))
                .failing("Standard_D2s_v5", 1)
                .failing("Standard_D3s_v5", 1),
        );
        let settings = PoolSettings {
            sweep_limit: 1,
            ..fast_settings()
        };
        let pool = pool(service.clone(), settings);

        let result = pool.resolve_batch("eastus", &keys(2), 2).await;

        assert_eq!(result.values().filter(|c| c.is_error()).count(), 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_shutdown_still_covers_every_key() {
        let service = Arc::new(Scripted::new(Duration::from_millis(1)));
        let pool = pool(service, fast_settings());
        pool.shutdown_token().cancel();
        let keys = keys(4);

        let result = pool.resolve_batch("eastus", &keys, 2).await;

        assert_eq!(result.len(), 4);
        assert!(result.values().all(|c| c.is_error()));
    }

    #[tokio::test]
    async fn test_pause_returns_false_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!pause(Duration::from_secs(10), &token).await);
        assert!(pause(Duration::ZERO, &CancellationToken::new()).await);
    }
}
