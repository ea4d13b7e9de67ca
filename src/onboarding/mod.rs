//! Onboarding wizard: branding, project, data source crawl, test query.
//!
//! The controller owns the current step and runs each step's side effect
//! against the backend. Step 3 is gated on a crawl job that runs on the
//! backend; a poller watches its status until it completes, and the user
//! still has to press Next to move on.

pub mod controller;
pub mod crawl;
pub mod events;
pub mod model;
pub mod state;
pub mod sync;

pub use controller::{OnboardingController, SyncOutcome};
pub use crawl::{CrawlStatus, classify_status};
pub use events::{NoticeLevel, StepOrigin, WizardEvent};
pub use model::{
    CrawlCadence, CrawlDepth, DataSourceDraft, DataSourceForm, Organization, ProjectDraft,
};
pub use state::{CrawlPhase, WizardState, WizardStep};
pub use sync::{Operation, SuppressReason};
