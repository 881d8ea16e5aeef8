//! Prometheus metrics for the enrichment pipeline.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_request`, `inc_classification`) are no-ops if `init_metrics` was
//! never called, so library users and tests run without a registry.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `spot_enrich_score_requests_total` | Counter | `tier`, `outcome` |
//! | `spot_enrich_score_request_duration_seconds` | Histogram | `tier` |
//! | `spot_enrich_classifications_total` | Counter | `source` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::scoring::ScoreErrorKind;
use crate::EnrichError;

/// All metrics, stored together in a single [`OnceLock`].
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Scoring requests by tier and outcome.
    pub requests_total: CounterVec,
    /// Scoring request latency by tier.
    pub request_duration: HistogramVec,
    /// Final classifications by source tier.
    pub classifications_total: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_error(e: prometheus::Error) -> EnrichError {
    EnrichError::Other(format!("metrics init failed: {e}"))
}

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`EnrichError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), EnrichError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new(
            "spot_enrich_score_requests_total",
            "Scoring requests by tier and outcome",
        ),
        &["tier", "outcome"],
    )
    .map_err(init_error)?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(init_error)?;

    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "spot_enrich_score_request_duration_seconds",
            "Scoring request latency by tier",
        ),
        &["tier"],
    )
    .map_err(init_error)?;
    registry
        .register(Box::new(request_duration.clone()))
        .map_err(init_error)?;

    let classifications_total = CounterVec::new(
        Opts::new(
            "spot_enrich_classifications_total",
            "Final classifications by source tier",
        ),
        &["source"],
    )
    .map_err(init_error)?;
    registry
        .register(Box::new(classifications_total.clone()))
        .map_err(init_error)?;

    // A racing initialiser registers identical descriptors; first one wins.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        request_duration,
        classifications_total,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one scoring request; `failure` is `None` on success.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_request(tier: &str, failure: Option<ScoreErrorKind>, elapsed: Duration) {
    if let Some(m) = metrics() {
        let outcome = failure.map_or("ok", |kind| kind.as_str());
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[tier, outcome]) {
            c.inc();
        }
        if let Ok(h) = m.request_duration.get_metric_with_label_values(&[tier]) {
            h.observe(elapsed.as_secs_f64());
        }
    }
}

/// Count one final classification by its source label.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn inc_classification(source: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.classifications_total.get_metric_with_label_values(&[source]) {
            c.inc();
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let families = m.registry.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
