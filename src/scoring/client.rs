//! Primary placement score client.
//!
//! Talks to one pinned API version and caches its bearer token for the run.
//! A 401 drops the cached token so the next attempt fetches a new one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::credential::CredentialProvider;
use super::{fetch_token, placement_url, post_placement, PlacementRequest, ScoreError, ScoringService};
use crate::RawScoreLevel;

/// Default management endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

/// API version the primary client is pinned to.
pub const DEFAULT_API_VERSION: &str = "2025-06-05";

/// Placement score client for the primary tier.
///
/// ## Example
///
/// ```no_run
/// use spot_enrich::scoring::{AzureCliCredential, PlacementScoreClient};
/// use std::sync::Arc;
///
/// let client = PlacementScoreClient::new("00000000-0000-0000-0000-000000000000", Arc::new(AzureCliCredential::new()))
///     .with_timeout(std::time::Duration::from_secs(20));
/// ```
pub struct PlacementScoreClient {
    http: reqwest::Client,
    endpoint: String,
    subscription_id: String,
    api_version: String,
    timeout: Duration,
    credential: Arc<dyn CredentialProvider>,
    cached_token: Mutex<Option<String>>,
}

impl PlacementScoreClient {
    /// Create a client for `subscription_id`.
    pub fn new(subscription_id: impl Into<String>, credential: Arc<dyn CredentialProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            subscription_id: subscription_id.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout: Duration::from_secs(30),
            credential,
            cached_token: Mutex::new(None),
        }
    }

    /// Point the client at a different endpoint (tests, sovereign clouds).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Pin a different API version.
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn token(&self, cancel: &CancellationToken) -> Result<String, ScoreError> {
        let mut cached = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScoreError::cancelled()),
            guard = self.cached_token.lock() => guard,
        };
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = fetch_token(self.credential.as_ref(), cancel).await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.cached_token.lock().await = None;
    }
}

#[async_trait]
impl ScoringService for PlacementScoreClient {
    async fn score(
        &self,
        request: &PlacementRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawScoreLevel>, ScoreError> {
        let token = self.token(cancel).await?;
        let url = placement_url(
            &self.endpoint,
            &self.subscription_id,
            &request.location,
            &self.api_version,
        );

        let result = post_placement(
            &self.http,
            &url,
            &token,
            request,
            self.timeout,
            cancel,
            "live",
        )
        .await;

        if let Err(err) = &result {
            if err.status == Some(StatusCode::UNAUTHORIZED.as_u16()) {
                debug!("placement score API rejected cached token; dropping it");
                self.invalidate_token().await;
            }
        }
        result
    }
}
