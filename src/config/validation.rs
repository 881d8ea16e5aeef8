//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`EnricherConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::EnricherConfig;

/// Largest batch the scoring service accepts in one request.
pub const MAX_BATCH_LIMIT: usize = 5;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "backoff.base_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on an [`EnricherConfig`].
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &EnricherConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();
    let enrichment = &config.enrichment;

    // ── Worker pool ──────────────────────────────────────────────────
    if enrichment.concurrency_limit == 0 {
        errors.push(invalid(
            "enrichment.concurrency_limit",
            0,
            "must be at least 1",
        ));
    }

    if enrichment.batch_limit > MAX_BATCH_LIMIT {
        errors.push(invalid(
            "enrichment.batch_limit",
            enrichment.batch_limit,
            "must be \u{2264} 5 (service cap)",
        ));
    }

    if enrichment.group_timeout_ms == 0 {
        errors.push(invalid(
            "enrichment.group_timeout_ms",
            0,
            "must be at least 1ms",
        ));
    }

    if enrichment.direct_fallback_after == 0 {
        errors.push(invalid(
            "enrichment.direct_fallback_after",
            0,
            "must be at least 1",
        ));
    }

    // ── Backoff ──────────────────────────────────────────────────────
    if config.backoff.base_ms > config.backoff.max_ms {
        errors.push(invalid(
            "backoff.base_ms",
            config.backoff.base_ms,
            "must be \u{2264} max_ms",
        ));
    }

    // ── Scoring ──────────────────────────────────────────────────────
    if config.scoring.desired_count == 0 {
        errors.push(invalid("scoring.desired_count", 0, "must be at least 1"));
    }

    if config.scoring.api_version.trim().is_empty() {
        errors.push(invalid(
            "scoring.api_version",
            "",
            "api version must not be empty",
        ));
    }

    if config.scoring.direct_api_versions.is_empty()
        || config
            .scoring
            .direct_api_versions
            .iter()
            .any(|v| v.trim().is_empty())
    {
        errors.push(invalid(
            "scoring.direct_api_versions",
            format!("{:?}", config.scoring.direct_api_versions),
            "must list at least one non-empty version",
        ));
    }

    if config.scoring.request_timeout_ms == 0 {
        errors.push(invalid(
            "scoring.request_timeout_ms",
            0,
            "must be at least 1ms",
        ));
    }

    // ── Pricing ──────────────────────────────────────────────────────
    if config.pricing.regions.is_empty()
        || config.pricing.regions.iter().any(|r| r.trim().is_empty())
    {
        errors.push(invalid(
            "pricing.regions",
            format!("{:?}", config.pricing.regions),
            "must list at least one non-empty region",
        ));
    }

    if config.pricing.max_pages == 0 {
        errors.push(invalid("pricing.max_pages", 0, "must be at least 1"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: &ConfigError) -> &str {
        match err {
            ConfigError::InvalidField { field, .. } => field,
            _ => "",
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&EnricherConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = EnricherConfig::default();
        config.enrichment.concurrency_limit = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(field_of(&errors[0]), "enrichment.concurrency_limit");
    }

    #[test]
    fn test_batch_limit_above_service_cap_is_rejected() {
        let mut config = EnricherConfig::default();
        config.enrichment.batch_limit = 6;
        let errors = validate(&config).unwrap_err();
        assert_eq!(field_of(&errors[0]), "enrichment.batch_limit");
    }

    #[test]
    fn test_batch_limit_zero_disables_batching_and_is_valid() {
        let mut config = EnricherConfig::default();
        config.enrichment.batch_limit = 0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_base_above_max_is_rejected() {
        let mut config = EnricherConfig::default();
        config.backoff.base_ms = 10_000;
        config.backoff.max_ms = 100;
        let errors = validate(&config).unwrap_err();
        assert_eq!(field_of(&errors[0]), "backoff.base_ms");
    }

    #[test]
    fn test_empty_direct_versions_is_rejected() {
        let mut config = EnricherConfig::default();
        config.scoring.direct_api_versions.clear();
        let errors = validate(&config).unwrap_err();
        assert_eq!(field_of(&errors[0]), "scoring.direct_api_versions");
    }

    #[test]
    fn test_empty_regions_is_rejected() {
        let mut config = EnricherConfig::default();
        config.pricing.regions = vec![" ".into()];
        let errors = validate(&config).unwrap_err();
        assert_eq!(field_of(&errors[0]), "pricing.regions");
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = EnricherConfig::default();
        config.enrichment.concurrency_limit = 0;
        config.enrichment.group_timeout_ms = 0;
        config.scoring.desired_count = 0;
        config.pricing.max_pages = 0;
        let errors = validate(&config).unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_invalid_field_message_names_field_and_value() {
        let err = invalid("enrichment.batch_limit", 9, "must be \u{2264} 5 (service cap)");
        let msg = err.to_string();
        assert!(msg.contains("enrichment.batch_limit"));
        assert!(msg.contains('9'));
    }
}
