//! Engine error types

use crate::bridge::DelegateError;
use crate::registry::RegistryError;
use crate::task::ConfigError;

/// Errors returned by [`RunService`](super::RunService) operations.
///
/// Failures inside a run never surface here; they end the run as `failed`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Cancellation is only supported for delegated runs: {0}")]
    CancelUnsupported(String),

    #[error("No delegate executor configured")]
    NoDelegate,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Delegate error: {0}")]
    Delegate(#[from] DelegateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}
