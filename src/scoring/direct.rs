//! Direct-protocol rescue client.
//!
//! Used only as a second chance inside the retrying query. Fetches a fresh
//! bearer token on every call, then walks the configured API versions newest
//! first until one returns a score.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::DEFAULT_ENDPOINT;
use super::credential::CredentialProvider;
use super::{
    fetch_token, placement_url, post_placement, DirectScorer, PlacementRequest, ScoreError, ScoreErrorKind,
};
use crate::RawScoreLevel;

/// API versions tried by default, newest first.
pub const DEFAULT_API_VERSIONS: [&str; 3] =
    ["2025-06-05", "2024-06-01-preview", "2024-03-01-preview"];

/// Raw HTTP placement score client that tries several API versions.
pub struct DirectProtocolClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    api_versions: Vec<String>,
    desired_count: u32,
    timeout: Duration,
    credential: Arc<dyn CredentialProvider>,
}

impl DirectProtocolClient {
    /// Create a client for `subscription_id` with the default version list.
    pub fn new(subscription_id: impl Into<String>, credential: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            subscription_id: subscription_id.into(),
            api_versions: DEFAULT_API_VERSIONS.iter().map(|v| v.to_string()).collect(),
            desired_count: 1,
            timeout: Duration::from_secs(30),
            credential,
        }
    }

    /// Point the client at a different endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Replace the version list; order is the order tried.
    pub fn with_api_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Set the `desiredCount` hint.
    pub fn with_desired_count(mut self, desired_count: u32) -> Self {
        self.desired_count = desired_count;
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl DirectScorer for DirectProtocolClient {
    async fn query_direct(
        &self,
        region: &str,
        sku: &str,
        cancel: &CancellationToken,
    ) -> Result<RawScoreLevel, ScoreError> {
        let token = fetch_token(self.credential.as_ref(), cancel).await?;
        let body = PlacementRequest::new(region, [sku], self.desired_count);

        for version in &self.api_versions {
            let url = placement_url(&self.endpoint, &self.subscription_id, region, version);
            match post_placement(
                &self.http,
                &url,
                &token,
                &body,
                self.timeout,
                cancel,
                "direct",
            )
            .await
            {
                Ok(scores) => {
                    if let Some(level) = scores.first() {
                        debug!(region, sku, api_version = %version, score = %level, "direct: scored");
                        return Ok(*level);
                    }
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(err);
                    }
                    debug!(region, sku, api_version = %version, error = %err, "direct: version failed");
                }
            }
        }

        warn!(region, sku, "direct: no score in any API version");
        Err(ScoreError::new(
            ScoreErrorKind::NoScoreReturned,
            format!(
                "no score in any API version (tried {})",
                self.api_versions.join(", ")
            ),
        ))
    }
}
