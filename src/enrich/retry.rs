//! Retrying single-key query.
//!
//! One scoring request per attempt, exponential backoff with jitter between
//! attempts, and a one-time direct-protocol rescue at a fixed failure count.
//!
//! The loop is split in two: [`RetryPolicy::next_action`] is a pure function
//! of the [`RetryState`] and decides what happens after a failure;
//! [`SingleKeyQuery::query_with_retry`] executes that decision (sleeping,
//! calling the rescue, giving up).
//!
//! ```text
//! Attempting ──ok──► Succeeded
//!     │ err
//!     ▼
//! next_action ──FallbackToDirect──► direct ok ──► Succeeded
//!     │  │                              │ err
//!     │  └──────Retry(delay)◄───────────┘ (re-decide)
//!     ▼
//!   GiveUp ──► Exhausted
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{BucketTable, EvictionClassification, SourceTier};
use crate::config::{BackoffConfig, EnrichmentConfig};
use crate::estimate::estimate;
use crate::scoring::{
    DirectScorer, PlacementRequest, ScoreError, ScoreErrorKind, ScoringService,
};
use crate::ScoreKey;

/// Backoff and rescue policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Delay cap.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter_max: Duration,
    /// Failure count at which the direct rescue runs.
    pub direct_after: u32,
}

/// What to do after a failed attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Sleep `delay` (plus jitter), then attempt again.
    Retry(Duration),
    /// Try the direct-protocol client once.
    FallbackToDirect,
    /// Stop; the key is exhausted for this tier.
    GiveUp,
}

/// Transient per-key state, discarded when the query returns.
#[derive(Clone, Debug)]
pub struct RetryState {
    /// Primary attempts issued so far.
    pub attempts: u32,
    /// Primary attempts that failed.
    pub failures: u32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Whether a direct client exists.
    pub direct_available: bool,
    /// Whether the direct rescue already ran.
    pub direct_used: bool,
    /// Most recent failure, primary or direct rescue.
    pub last_error: Option<ScoreError>,
}

impl RetryState {
    /// Fresh state for one key.
    pub fn new(max_retries: u32, direct_available: bool) -> Self {
        Self {
            attempts: 0,
            failures: 0,
            max_retries,
            direct_available,
            direct_used: false,
            last_error: None,
        }
    }

    fn record_failure(&mut self, err: ScoreError) {
        self.failures += 1;
        self.last_error = Some(err);
    }
}

impl RetryPolicy {
    /// Policy without delays; the direct rescue runs at the second failure.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max: Duration::ZERO,
            direct_after: 2,
        }
    }

    /// Exponential policy starting at `base_delay`, capped at 60s, no jitter.
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: Duration::from_secs(60),
            jitter_max: Duration::ZERO,
            direct_after: 2,
        }
    }

    /// Policy described by the config sections.
    pub fn from_config(enrichment: &EnrichmentConfig, backoff: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(backoff.base_ms),
            max_delay: Duration::from_millis(backoff.max_ms),
            jitter_max: Duration::from_millis(backoff.jitter_max_ms),
            direct_after: enrichment.direct_fallback_after,
        }
    }

    /// Set the jitter ceiling.
    pub fn with_jitter_max(mut self, jitter_max: Duration) -> Self {
        self.jitter_max = jitter_max;
        self
    }

    /// Set the failure count at which the direct rescue runs.
    pub fn with_direct_after(mut self, direct_after: u32) -> Self {
        self.direct_after = direct_after;
        self
    }

    /// Decide the next step after a failure. Pure: never sleeps, never
    /// performs I/O.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn next_action(&self, state: &RetryState) -> RetryAction {
        if state.direct_available && !state.direct_used && state.failures == self.direct_after {
            return RetryAction::FallbackToDirect;
        }
        if state.failures > state.max_retries {
            return RetryAction::GiveUp;
        }
        RetryAction::Retry(self.backoff_delay(state.failures))
    }

    /// Exponential delay after `failures` failures: `base * 2^(failures-1)`,
    /// capped at `max_delay`.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// Add uniform random jitter in `[0, jitter_max]` to `duration`.
pub fn with_jitter(duration: Duration, jitter_max: Duration) -> Duration {
    let ceiling = jitter_max.as_millis() as u64;
    if ceiling == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..=ceiling);
    duration + Duration::from_millis(jitter)
}

/// Result of one single-key query.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// A score was obtained (live or direct).
    Succeeded(EvictionClassification),
    /// Every attempt failed.
    Exhausted {
        /// Most recent failure. A failed direct rescue counts when no primary
        /// attempt followed it.
        last_error: ScoreError,
        /// Primary attempts issued.
        attempts: u32,
    },
}

impl QueryOutcome {
    fn cancelled(attempts: u32) -> Self {
        Self::Exhausted {
            last_error: ScoreError::cancelled(),
            attempts,
        }
    }
}

/// Retrying query for one key at a time.
pub struct SingleKeyQuery {
    service: Arc<dyn ScoringService>,
    direct: Option<Arc<dyn DirectScorer>>,
    policy: RetryPolicy,
    table: BucketTable,
    desired_count: u32,
}

impl SingleKeyQuery {
    /// Create a query over `service` with no direct rescue.
    pub fn new(service: Arc<dyn ScoringService>, policy: RetryPolicy) -> Self {
        Self {
            service,
            direct: None,
            policy,
            table: BucketTable::default(),
            desired_count: 1,
        }
    }

    /// Enable the direct-protocol rescue.
    pub fn with_direct(mut self, direct: Arc<dyn DirectScorer>) -> Self {
        self.direct = Some(direct);
        self
    }

    /// Bucket table for scored classifications.
    pub fn with_table(mut self, table: BucketTable) -> Self {
        self.table = table;
        self
    }

    /// `desiredCount` hint sent with every request.
    pub fn with_desired_count(mut self, desired_count: u32) -> Self {
        self.desired_count = desired_count;
        self
    }

    /// Query one key, retrying up to `max_retries` times after the first
    /// attempt.
    ///
    /// Returns promptly with a `Timeout` exhaustion when `cancel` fires.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn query_with_retry(
        &self,
        key: &ScoreKey,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> QueryOutcome {
        let request = PlacementRequest::single(key, self.desired_count);
        let mut state = RetryState::new(max_retries, self.direct.is_some());

        loop {
            if cancel.is_cancelled() {
                return QueryOutcome::cancelled(state.attempts);
            }

            state.attempts += 1;
            debug!(key = %key, attempt = state.attempts, max_retries, "query: attempting");

            match self.service.score(&request, cancel).await {
                Ok(scores) => match scores.first() {
                    Some(level) => {
                        if state.attempts > 1 {
                            debug!(key = %key, attempts = state.attempts, "query: succeeded after retries");
                        }
                        return QueryOutcome::Succeeded(EvictionClassification::from_score(
                            *level,
                            self.table,
                            SourceTier::LiveScore,
                        ));
                    }
                    None => state.record_failure(ScoreError::new(
                        ScoreErrorKind::NoScoreReturned,
                        "placement score list was empty",
                    )),
                },
                Err(err) => {
                    warn!(key = %key, attempt = state.attempts, error = %err, "query: attempt failed");
                    state.record_failure(err);
                }
            }

            if cancel.is_cancelled() {
                return QueryOutcome::cancelled(state.attempts);
            }

            loop {
                match self.policy.next_action(&state) {
                    RetryAction::FallbackToDirect => {
                        state.direct_used = true;
                        let Some(direct) = self.direct.as_ref() else {
                            continue;
                        };
                        debug!(key = %key, failures = state.failures, "query: trying direct protocol");
                        match direct.query_direct(&key.region, &key.sku, cancel).await {
                            Ok(level) => {
                                return QueryOutcome::Succeeded(
                                    EvictionClassification::from_score(
                                        level,
                                        self.table,
                                        SourceTier::DirectProtocol,
                                    ),
                                );
                            }
                            Err(err) => {
                                warn!(key = %key, error = %err, "query: direct protocol failed");
                                if cancel.is_cancelled() {
                                    return QueryOutcome::cancelled(state.attempts);
                                }
                                // Not a primary failure: the counter stays put.
                                state.last_error = Some(err);
                            }
                        }
                    }
                    RetryAction::Retry(delay) => {
                        let delay = with_jitter(delay, self.policy.jitter_max);
                        debug!(key = %key, delay_ms = delay.as_millis() as u64, "query: backing off");
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return QueryOutcome::cancelled(state.attempts),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        break;
                    }
                    RetryAction::GiveUp => {
                        warn!(key = %key, attempts = state.attempts, "query: all attempts exhausted");
                        let last_error = state.last_error.take().unwrap_or_else(|| {
                            ScoreError::new(ScoreErrorKind::ApiFailed, "no attempt recorded")
                        });
                        return QueryOutcome::Exhausted {
                            last_error,
                            attempts: state.attempts,
                        };
                    }
                }
            }
        }
    }

    /// Turn an outcome into a classification.
    ///
    /// `terminal` marks the last tier of the chain: exhaustion there yields a
    /// static estimate. Earlier tiers record an error placeholder carrying
    /// the failure kind, so a later tier may still replace it.
    pub fn resolve(key: &ScoreKey, outcome: QueryOutcome, terminal: bool) -> EvictionClassification {
        match outcome {
            QueryOutcome::Succeeded(classification) => classification,
            QueryOutcome::Exhausted { .. } if terminal => estimate(&key.sku),
            QueryOutcome::Exhausted { last_error, .. } => {
                EvictionClassification::error_placeholder(last_error.kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawScoreLevel;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then answers `level`.
    struct Flaky {
        failures: u32,
        level: RawScoreLevel,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32, level: RawScoreLevel) -> Self {
            Self {
                failures,
                level,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ScoringService for Flaky {
        async fn score(
            &self,
            _request: &PlacementRequest,
            _cancel: &CancellationToken,
        ) -> Result<Vec<RawScoreLevel>, ScoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(ScoreError::new(ScoreErrorKind::RateLimited, "429"))
            } else {
                Ok(vec![self.level])
            }
        }
    }

    struct Direct {
        result: Result<RawScoreLevel, ScoreErrorKind>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DirectScorer for Direct {
        async fn query_direct(
            &self,
            _region: &str,
            _sku: &str,
            _cancel: &CancellationToken,
        ) -> Result<RawScoreLevel, ScoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .map_err(|kind| ScoreError::new(kind, "direct failed"))
        }
    }

    fn state(failures: u32, max_retries: u32, direct_available: bool, direct_used: bool) -> RetryState {
        RetryState {
            attempts: failures,
            failures,
            max_retries,
            direct_available,
            direct_used,
            last_error: None,
        }
    }

    fn key() -> ScoreKey {
        ScoreKey::new("eastus", "Standard_D4s_v5")
    }

    // ── next_action ──────────────────────────────────────────────────

    #[test]
    fn test_next_action_retries_after_first_failure() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(
            policy.next_action(&state(1, 4, true, false)),
            RetryAction::Retry(Duration::from_millis(100))
        );
    }

    #[test]
    fn test_next_action_falls_back_to_direct_at_second_failure() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(
            policy.next_action(&state(2, 4, true, false)),
            RetryAction::FallbackToDirect
        );
    }

    #[test]
    fn test_next_action_direct_runs_only_once() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(
            policy.next_action(&state(2, 4, true, true)),
            RetryAction::Retry(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_next_action_without_direct_client_retries() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(
            policy.next_action(&state(2, 4, false, false)),
            RetryAction::Retry(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_next_action_gives_up_past_max_retries() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(policy.next_action(&state(4, 4, false, false)), RetryAction::Retry(Duration::from_millis(800)));
        assert_eq!(policy.next_action(&state(5, 4, false, false)), RetryAction::GiveUp);
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_max: Duration::ZERO,
            direct_after: 2,
        };
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(40));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(50));
        assert_eq!(policy.backoff_delay(60), Duration::from_millis(50));
    }

    #[test]
    fn test_policy_builders_move_checkpoint_and_jitter() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100))
            .with_jitter_max(Duration::from_millis(250))
            .with_direct_after(3);

        assert_eq!(policy.jitter_max, Duration::from_millis(250));
        assert_eq!(
            policy.next_action(&state(2, 4, true, false)),
            RetryAction::Retry(Duration::from_millis(200))
        );
        assert_eq!(
            policy.next_action(&state(3, 4, true, false)),
            RetryAction::FallbackToDirect
        );
    }

    #[test]
    fn test_jitter_stays_within_ceiling() {
        let base = Duration::from_secs(1);
        for _ in 0..50 {
            let jittered = with_jitter(base, Duration::from_secs(3));
            assert!(jittered >= base);
            assert!(jittered <= base + Duration::from_secs(3));
        }
    }

    #[test]
    fn test_zero_jitter_is_identity() {
        assert_eq!(
            with_jitter(Duration::from_millis(7), Duration::ZERO),
            Duration::from_millis(7)
        );
    }

    // ── query_with_retry ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_query_succeeds_after_transient_failure() {
        let service = Arc::new(Flaky::new(1, RawScoreLevel::High));
        let query = SingleKeyQuery::new(service.clone(), RetryPolicy::immediate());

        let outcome = query
            .query_with_retry(&key(), 4, &CancellationToken::new())
            .await;

        match outcome {
            QueryOutcome::Succeeded(c) => {
                assert_eq!(c.risk_label(), "Very Low");
                assert_eq!(c.source_tier(), Some(SourceTier::LiveScore));
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_query_uses_direct_rescue_on_second_failure() {
        let service = Arc::new(Flaky::new(u32::MAX, RawScoreLevel::High));
        let direct = Arc::new(Direct {
            result: Ok(RawScoreLevel::Medium),
            calls: AtomicU32::new(0),
        });
        let query = SingleKeyQuery::new(service.clone(), RetryPolicy::immediate())
            .with_direct(direct.clone());

        let outcome = query
            .query_with_retry(&key(), 4, &CancellationToken::new())
            .await;

        match outcome {
            QueryOutcome::Succeeded(c) => {
                assert_eq!(c.source_tier(), Some(SourceTier::DirectProtocol));
                assert_eq!(c.percent_bucket(), "5-15%");
            }
            other => panic!("expected direct success, got {other:?}"),
        }
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_failed_direct_keeps_retrying_primary() {
        let service = Arc::new(Flaky::new(u32::MAX, RawScoreLevel::High));
        let direct = Arc::new(Direct {
            result: Err(ScoreErrorKind::NoScoreReturned),
            calls: AtomicU32::new(0),
        });
        let query = SingleKeyQuery::new(service.clone(), RetryPolicy::immediate())
            .with_direct(direct.clone());

        let outcome = query
            .query_with_retry(&key(), 3, &CancellationToken::new())
            .await;

        match outcome {
            QueryOutcome::Exhausted { last_error, attempts } => {
                assert_eq!(attempts, 4);
                assert_eq!(last_error.kind, ScoreErrorKind::RateLimited);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_reports_direct_error_when_it_is_the_last_failure() {
        let service = Arc::new(Flaky::new(u32::MAX, RawScoreLevel::High));
        let direct = Arc::new(Direct {
            result: Err(ScoreErrorKind::NoScoreReturned),
            calls: AtomicU32::new(0),
        });
        let query = SingleKeyQuery::new(
            service.clone(),
            RetryPolicy::immediate().with_direct_after(1),
        )
        .with_direct(direct.clone());

        let outcome = query
            .query_with_retry(&key(), 0, &CancellationToken::new())
            .await;

        match outcome {
            QueryOutcome::Exhausted { last_error, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error.kind, ScoreErrorKind::NoScoreReturned);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_query_honours_cancellation_during_backoff() {
        let service = Arc::new(Flaky::new(u32::MAX, RawScoreLevel::High));
        let query = SingleKeyQuery::new(
            service.clone(),
            RetryPolicy::exponential(Duration::from_secs(30)),
        );
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            query.query_with_retry(&key(), 4, &cancel),
        )
        .await
        .expect("test: cancellation must end the query");

        match outcome {
            QueryOutcome::Exhausted { last_error, .. } => {
                assert_eq!(last_error.kind, ScoreErrorKind::Timeout);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_terminal_exhaustion_is_static_estimate() {
        let outcome = QueryOutcome::Exhausted {
            last_error: ScoreError::new(ScoreErrorKind::RateLimited, "429"),
            attempts: 5,
        };
        let c = SingleKeyQuery::resolve(&key(), outcome, true);
        assert_eq!(c.source_tier(), Some(SourceTier::StaticEstimate));
        assert_eq!(c.risk_label(), "Medium-High");
    }

    #[test]
    fn test_resolve_intermediate_exhaustion_is_error_placeholder() {
        let outcome = QueryOutcome::Exhausted {
            last_error: ScoreError::new(ScoreErrorKind::BadRequest, "400"),
            attempts: 5,
        };
        let c = SingleKeyQuery::resolve(&key(), outcome, false);
        assert!(c.is_error());
        assert_eq!(c.error_kind(), Some(ScoreErrorKind::BadRequest));
        assert_eq!(c.risk_label(), "BadRequest");
    }
}
