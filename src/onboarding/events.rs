//! Events broadcast by the controller to whatever renders the wizard.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::state::{CrawlPhase, WizardStep};

/// Who moved the wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrigin {
    /// Next/Back.
    User,
    /// Applied from the onboarding status service.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WizardEvent {
    StepChanged {
        from: WizardStep,
        to: WizardStep,
        origin: StepOrigin,
    },
    CrawlPhaseChanged {
        phase: CrawlPhase,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    /// User-visible notification.
    Notice {
        level: NoticeLevel,
        message: String,
        at: DateTime<Utc>,
    },
    /// Onboarding is done; leave the wizard.
    Redirect { to: String },
}

impl WizardEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Notice {
            level: NoticeLevel::Info,
            message: message.into(),
            at: Utc::now(),
        }
    }
}
