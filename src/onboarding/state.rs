//! Wizard state machine: which step the user is on and where the crawl is.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::model::{DataSourceDraft, Organization, ProjectDraft};

/// The four wizard steps.
///
/// Progresses linearly: Branding → Project → DataSource → Test. Serialized
/// with the step keys the onboarding status service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    Branding,
    Project,
    DataSource,
    Test,
}

impl WizardStep {
    pub const ALL: [WizardStep; 4] = [
        WizardStep::Branding,
        WizardStep::Project,
        WizardStep::DataSource,
        WizardStep::Test,
    ];

    /// 1-based step number as shown to the user.
    pub fn number(&self) -> u8 {
        match self {
            Self::Branding => 1,
            Self::Project => 2,
            Self::DataSource => 3,
            Self::Test => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Self::ALL.get(usize::from(n).checked_sub(1)?).copied()
    }

    /// Step key used by the onboarding status service.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Branding => "branding",
            Self::Project => "project",
            Self::DataSource => "data_source",
            Self::Test => "test",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key.trim())
    }

    pub fn next(&self) -> Option<WizardStep> {
        Self::from_number(self.number() + 1)
    }

    pub fn previous(&self) -> Option<WizardStep> {
        Self::from_number(self.number() - 1)
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::Branding => "Branding",
            Self::Project => "Project",
            Self::DataSource => "Data source",
            Self::Test => "Test query",
        }
    }
}

impl Default for WizardStep {
    fn default() -> Self {
        Self::Branding
    }
}

impl std::fmt::Display for WizardStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Where the step-3 crawl is.
///
/// Within one visit to step 3 the phase only moves forward:
/// Idle → Creating → Crawling → Complete. `Failed` and `Stalled` end a crawl
/// without completing it; both allow a new start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    Idle,
    Creating,
    Crawling,
    Complete,
    Failed,
    Stalled,
}

impl CrawlPhase {
    pub fn can_transition_to(&self, target: CrawlPhase) -> bool {
        use CrawlPhase::*;
        matches!(
            (self, target),
            (Idle | Complete | Failed | Stalled, Creating)
                | (Creating, Crawling)
                | (Creating, Idle)
                | (Crawling, Complete | Failed | Stalled | Idle)
        )
    }

    /// A data source is being created/started or the job is running.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Creating | Self::Crawling)
    }

    /// The crawl has stopped and polling is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Stalled)
    }
}

impl Default for CrawlPhase {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Creating => "creating",
            Self::Crawling => "crawling",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        };
        write!(f, "{s}")
    }
}

/// Everything the wizard knows about the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WizardState {
    pub current_step: WizardStep,
    /// Furthest step this session has reached. Remote status only moves the
    /// wizard when it reports a step beyond this.
    pub furthest_step: WizardStep,
    pub organization: Organization,
    pub project: ProjectDraft,
    pub data_source: DataSourceDraft,
    pub crawl_phase: CrawlPhase,
    /// Last raw status text reported by the crawl service.
    pub crawl_status: Option<String>,
    pub completed_steps: BTreeSet<WizardStep>,
    pub test_query: Option<String>,
    pub test_response: Option<String>,
    /// Set once the completion call succeeded.
    pub finished: bool,
}

impl WizardState {
    /// Move to `step`, keeping the high-water mark current.
    pub fn enter(&mut self, step: WizardStep) {
        self.current_step = step;
        if step > self.furthest_step {
            self.furthest_step = step;
        }
    }

    pub fn mark_completed(&mut self, step: WizardStep) {
        self.completed_steps.insert(step);
    }

    pub fn is_completed(&self, step: WizardStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Clamp a requested step to what the local state can support: steps
    /// past project creation need a project id, and the test step needs a
    /// completed crawl.
    pub fn reachable(&self, requested: WizardStep) -> WizardStep {
        if requested >= WizardStep::DataSource && self.project.id.is_none() {
            return WizardStep::Project;
        }
        if requested == WizardStep::Test && self.crawl_phase != CrawlPhase::Complete {
            return WizardStep::DataSource;
        }
        requested
    }
}
