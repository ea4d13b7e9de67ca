//! Error types for the onboarding controller.

use reqwest::StatusCode;

use crate::onboarding::state::WizardStep;
use crate::onboarding::sync::Operation;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Wizard error: {0}")]
    Wizard(#[from] WizardError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors talking to the backend services.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Request to {endpoint} failed: {reason}")]
    Request { endpoint: String, reason: String },

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: StatusCode,
        body: String,
    },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by wizard operations. Every variant leaves the wizard in an
/// interactive, retryable state.
#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    #[error("{field} {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Another operation is in progress: {operation}")]
    Busy { operation: Operation },

    #[error("Operation requires step {expected}, wizard is on step {actual}")]
    NotOnStep {
        expected: WizardStep,
        actual: WizardStep,
    },

    #[error("The crawl has not completed yet")]
    CrawlNotComplete,

    #[error("A crawl is already being started or running")]
    CrawlInProgress,

    #[error("Data source {id} already exists; its settings can no longer change")]
    DataSourceLocked { id: String },

    #[error("Onboarding is already under way; hydrate only loads a fresh wizard")]
    SessionInProgress,

    #[error("No project has been created yet")]
    MissingProject,

    #[error("Already at the first step")]
    AtFirstStep,

    #[error("Use finish() on the last step")]
    AtLastStep,

    #[error("Branding read back does not match what was saved: {field}")]
    ReadAfterWrite { field: &'static str },

    #[error("Onboarding already completed")]
    AlreadyCompleted,

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl WizardError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
