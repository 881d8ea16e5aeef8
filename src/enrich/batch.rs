//! Batch-query tier.
//!
//! Scores a small region group in one request. The service caps a batch at
//! five sizes, so larger groups skip straight to the worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{BucketTable, EvictionClassification, SourceTier};
use crate::scoring::{pair_positionally, PlacementRequest, ScoringService};
use crate::ScoreKey;

/// One-request scoring of a whole region group.
pub struct BatchQuery {
    service: Arc<dyn ScoringService>,
    batch_limit: usize,
    table: BucketTable,
    desired_count: u32,
}

impl BatchQuery {
    /// Create a batch tier over `service`. `batch_limit == 0` disables it.
    pub fn new(
        service: Arc<dyn ScoringService>,
        batch_limit: usize,
        table: BucketTable,
        desired_count: u32,
    ) -> Self {
        Self {
            service,
            batch_limit,
            table,
            desired_count,
        }
    }

    /// Whether a group of `len` keys is small enough to batch.
    pub fn accepts(&self, len: usize) -> bool {
        (1..=self.batch_limit).contains(&len)
    }

    /// Score every key of `region` in one request.
    ///
    /// All-or-nothing: a request error, an empty response or a response
    /// whose length differs from `keys` yields an empty map, and every key
    /// falls through to the next tier.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn try_batch(
        &self,
        region: &str,
        keys: &[ScoreKey],
        cancel: &CancellationToken,
    ) -> BTreeMap<ScoreKey, EvictionClassification> {
        if !self.accepts(keys.len()) {
            return BTreeMap::new();
        }

        let request = PlacementRequest::new(
            region,
            keys.iter().map(|k| k.sku.as_str()),
            self.desired_count,
        );
        debug!(region, keys = keys.len(), "batch: requesting scores");

        let scores = match self.service.score(&request, cancel).await {
            Ok(scores) => scores,
            Err(err) => {
                warn!(region, keys = keys.len(), error = %err, "batch: request failed");
                return BTreeMap::new();
            }
        };

        match pair_positionally(keys, &scores) {
            Ok(pairs) => pairs
                .into_iter()
                .map(|(key, level)| {
                    let classification =
                        EvictionClassification::from_score(level, self.table, SourceTier::LiveScore);
                    (key, classification)
                })
                .collect(),
            Err(err) => {
                warn!(region, error = %err, "batch: discarding response");
                BTreeMap::new()
            }
        }
    }
}
