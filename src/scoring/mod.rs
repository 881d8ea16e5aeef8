//! # Scoring service boundary
//!
//! ## Responsibility
//! Define the seams to the placement score service: the [`ScoringService`]
//! trait used by every tier, the [`DirectScorer`] rescue trait, the wire
//! types, and the structured [`ScoreError`] whose kind is decided once here,
//! at the transport boundary.
//!
//! ## Modules
//!
//! - [`client`]: primary client, one pinned API version
//! - [`direct`]: direct-protocol rescue, walks a list of API versions
//! - [`credential`]: bearer tokens from the ambient session
//!
//! ## Guarantees
//! - An empty score list is always an error (`NoScoreReturned`), never `Ok`
//! - Every HTTP call and credential fetch races the caller's [`CancellationToken`]
//! - Response-to-request pairing happens only in [`pair_positionally`]
//!
//! ## NOT Responsible For
//! - Retry and fallback decisions (see: `enrich`)
//! - Turning scores into labels (see: `classify`)

pub mod client;
pub mod credential;
pub mod direct;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{metrics, RawScoreLevel, ScoreKey};

pub use client::PlacementScoreClient;
pub use credential::{AzureCliCredential, CredentialProvider, EnvCredential, StaticCredential};
pub use direct::DirectProtocolClient;

/// Failure categories of a scoring call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScoreErrorKind {
    /// HTTP 429.
    RateLimited,
    /// The response body did not have the expected shape.
    ParserError,
    /// The service rejected the request (400, 404, 422).
    BadRequest,
    /// The request timed out or was cancelled.
    Timeout,
    /// Any other failure.
    #[serde(rename = "APIFailed")]
    ApiFailed,
    /// The service answered with an empty or unusable score list.
    NoScoreReturned,
}

impl ScoreErrorKind {
    /// Kind for a non-success HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited,
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::BadRequest
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Self::Timeout,
            _ => Self::ApiFailed,
        }
    }

    /// Display name, also used as the placeholder label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RateLimited",
            Self::ParserError => "ParserError",
            Self::BadRequest => "BadRequest",
            Self::Timeout => "Timeout",
            Self::ApiFailed => "APIFailed",
            Self::NoScoreReturned => "NoScoreReturned",
        }
    }
}

impl fmt::Display for ScoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed scoring call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ScoreError {
    /// Category, set where the failure was observed.
    pub kind: ScoreErrorKind,
    /// Human-readable detail for logs.
    pub message: String,
    /// HTTP status, when the service answered.
    pub status: Option<u16>,
}

impl ScoreError {
    /// Create a new error.
    pub fn new(kind: ScoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Attach the HTTP status the service answered with.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status.as_u16());
        self
    }

    /// The caller's cancellation token fired.
    pub fn cancelled() -> Self {
        Self::new(ScoreErrorKind::Timeout, "request cancelled")
    }

    /// Categorise a transport-level reqwest error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ScoreErrorKind::Timeout
        } else if err.is_decode() {
            ScoreErrorKind::ParserError
        } else if let Some(status) = err.status() {
            ScoreErrorKind::from_status(status)
        } else {
            ScoreErrorKind::ApiFailed
        };
        Self::new(kind, err.to_string())
    }
}

/// One entry of `desiredSizes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredSize {
    /// ARM SKU name.
    pub sku: String,
}

/// Placement score request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    /// Region the request is scoped to.
    pub location: String,
    /// Number of instances the caller would place.
    pub desired_count: u32,
    /// Regions to score.
    pub desired_locations: Vec<String>,
    /// SKUs to score; the response preserves this order.
    pub desired_sizes: Vec<DesiredSize>,
}

impl PlacementRequest {
    /// Request scoring `skus` in `region`.
    pub fn new<I, S>(region: &str, skus: I, desired_count: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            location: region.to_string(),
            desired_count,
            desired_locations: vec![region.to_string()],
            desired_sizes: skus
                .into_iter()
                .map(|sku| DesiredSize { sku: sku.into() })
                .collect(),
        }
    }

    /// Request for exactly one key.
    pub fn single(key: &ScoreKey, desired_count: u32) -> Self {
        Self::new(&key.region, [key.sku.as_str()], desired_count)
    }
}

/// Placement score response body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementResponse {
    /// Scores in request order.
    #[serde(default, alias = "placementScore")]
    pub placement_scores: Vec<PlacementScoreEntry>,
}

/// One scored size.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementScoreEntry {
    /// Coarse score.
    pub score: RawScoreLevel,
    /// SKU, when the service echoes it.
    #[serde(default)]
    pub sku: Option<String>,
    /// Region, when the service echoes it.
    #[serde(default)]
    pub region: Option<String>,
}

/// Primary scoring seam.
///
/// Implementations must be `Send + Sync`; the worker pool shares one
/// instance across tasks through `Arc<dyn ScoringService>`.
#[async_trait]
pub trait ScoringService: Send + Sync {
    /// Score every size in `request`, in request order.
    ///
    /// Returns `Err` with [`ScoreErrorKind::NoScoreReturned`] rather than an
    /// empty vector.
    async fn score(
        &self,
        request: &PlacementRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawScoreLevel>, ScoreError>;
}

/// Second-chance scoring over a different protocol path.
#[async_trait]
pub trait DirectScorer: Send + Sync {
    /// Score one SKU in one region.
    async fn query_direct(
        &self,
        region: &str,
        sku: &str,
        cancel: &CancellationToken,
    ) -> Result<RawScoreLevel, ScoreError>;
}

/// The response carried a different number of scores than keys submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("positional pairing mismatch: {keys} keys, {scores} scores")]
pub struct PairingError {
    /// Keys in the request.
    pub keys: usize,
    /// Scores in the response.
    pub scores: usize,
}

/// Pair response score `i` with request key `i`.
///
/// The service does not echo keys reliably, so order is the only link
/// between the two arrays. Lengths must match exactly.
///
/// # Errors
///
/// Returns [`PairingError`] when the lengths differ.
pub fn pair_positionally(
    keys: &[ScoreKey],
    scores: &[RawScoreLevel],
) -> Result<Vec<(ScoreKey, RawScoreLevel)>, PairingError> {
    if keys.len() != scores.len() {
        return Err(PairingError {
            keys: keys.len(),
            scores: scores.len(),
        });
    }
    Ok(keys.iter().cloned().zip(scores.iter().copied()).collect())
}

/// Placement score resource URL for one API version.
pub(crate) fn placement_url(
    endpoint: &str,
    subscription_id: &str,
    location: &str,
    api_version: &str,
) -> String {
    format!(
        "{}/subscriptions/{subscription_id}/providers/Microsoft.Compute/locations/{location}/placementScores/spot/generate?api-version={api_version}",
        endpoint.trim_end_matches('/')
    )
}

/// Fetch a bearer token, racing the caller's cancellation token.
///
/// The Azure CLI can take seconds to answer; cancellation must not wait for it.
pub(crate) async fn fetch_token(
    credential: &dyn CredentialProvider,
    cancel: &CancellationToken,
) -> Result<String, ScoreError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScoreError::cancelled()),
        token = credential.bearer_token() => Ok(token?),
    }
}

/// POST a placement request and decode the scores.
///
/// Shared by the primary and direct clients so both categorise failures the
/// same way.
pub(crate) async fn post_placement(
    http: &reqwest::Client,
    url: &str,
    token: &str,
    body: &PlacementRequest,
    timeout: Duration,
    cancel: &CancellationToken,
    tier: &str,
) -> Result<Vec<RawScoreLevel>, ScoreError> {
    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ScoreError::cancelled()),
        result = send_placement(http, url, token, body, timeout) => result,
    };
    metrics::record_request(tier, result.as_ref().err().map(|e| e.kind), start.elapsed());
    result
}

async fn send_placement(
    http: &reqwest::Client,
    url: &str,
    token: &str,
    body: &PlacementRequest,
    timeout: Duration,
) -> Result<Vec<RawScoreLevel>, ScoreError> {
    let response = http
        .post(url)
        .bearer_auth(token)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| ScoreError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(ScoreError::new(
            ScoreErrorKind::from_status(status),
            format!("placement score API returned {status}: {detail}"),
        )
        .with_status(status));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ScoreError::from_reqwest(&e))?;
    let decoded: PlacementResponse = serde_json::from_slice(&bytes).map_err(|e| {
        ScoreError::new(
            ScoreErrorKind::ParserError,
            format!("unexpected placement score response: {e}"),
        )
    })?;

    if decoded.placement_scores.is_empty() {
        return Err(ScoreError::new(
            ScoreErrorKind::NoScoreReturned,
            "placement score list was empty",
        ));
    }

    Ok(decoded
        .placement_scores
        .into_iter()
        .map(|entry| entry.score)
        .collect())
}
