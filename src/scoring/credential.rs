//! Bearer credentials from the ambient session.
//!
//! [`AzureCliCredential`] shells out to `az account get-access-token`, the
//! same session a user already has after `az login`. [`EnvCredential`] reads
//! a pre-fetched token, useful in CI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use super::{ScoreError, ScoreErrorKind};

/// Resource the management-plane token is scoped to.
pub const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";

/// Environment variable read by [`EnvCredential::default`].
pub const TOKEN_ENV_VAR: &str = "AZURE_ACCESS_TOKEN";

/// Why a token could not be produced.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The credential program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that was invoked.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The credential program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        /// Program that was invoked.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The credential program did not finish in time.
    #[error("{program} did not return a token within {timeout_secs}s")]
    TimedOut {
        /// Program that was invoked.
        program: String,
        /// Configured limit.
        timeout_secs: u64,
    },

    /// No token was available.
    #[error("no access token available: {0}")]
    Missing(String),
}

impl From<CredentialError> for ScoreError {
    fn from(err: CredentialError) -> Self {
        let kind = match err {
            CredentialError::TimedOut { .. } => ScoreErrorKind::Timeout,
            _ => ScoreErrorKind::ApiFailed,
        };
        ScoreError::new(kind, err.to_string())
    }
}

/// Source of bearer tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produce a bearer token for the management plane.
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// Token from the Azure CLI login session.
#[derive(Debug, Clone)]
pub struct AzureCliCredential {
    program: PathBuf,
    timeout: Duration,
}

impl AzureCliCredential {
    /// Use `az` from `PATH` with a 30 second limit.
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("az"),
            timeout: Duration::from_secs(30),
        }
    }

    /// Use a different CLI binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Set the time limit for the CLI call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for AzureCliCredential {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for AzureCliCredential {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        let program = self.program.display().to_string();
        let output = Command::new(&self.program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                MANAGEMENT_RESOURCE,
                "--query",
                "accessToken",
                "--output",
                "tsv",
            ])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(CredentialError::Spawn { program, source }),
            Err(_) => {
                return Err(CredentialError::TimedOut {
                    program,
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        };

        if !output.status.success() {
            return Err(CredentialError::Failed {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(CredentialError::Missing(format!("{program} printed no token")));
        }
        Ok(token)
    }
}

/// Token read from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    /// Read the token from `var`.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredential {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredential {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(CredentialError::Missing(format!("{} is not set", self.var))),
        }
    }
}

/// Fixed token; for tests and pre-authenticated embedding.
#[derive(Debug, Clone)]
pub struct StaticCredential(String);

impl StaticCredential {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        Ok(self.0.clone())
    }
}
