//! Ownership of the current step between user actions and status sync.
//!
//! User-driven work runs inside an [`OperationGuard`]. While a guard is alive
//! no other operation can start and remote status sync is suspended. After a
//! step change the gate also holds sync off for a short window so a status
//! response that was already in flight cannot undo the navigation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::WizardError;

/// User-driven operations that suspend status sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    SaveBranding,
    CreateProject,
    StartCrawl,
    TestQuery,
    Complete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SaveBranding => "save_branding",
            Self::CreateProject => "create_project",
            Self::StartCrawl => "start_crawl",
            Self::TestQuery => "test_query",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// Why a status sync was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// Onboarding completion is in flight.
    Completing,
    /// A data source is being created or its crawl started.
    StartingCrawl,
    /// Some other user operation is in flight.
    OperationInFlight(Operation),
    /// The crawl job is running.
    CrawlRunning,
    /// Step 3 shows a finished crawl the user has not moved past yet.
    AwaitingNext,
    /// The user changed steps moments ago.
    ManualNavigation,
}

#[derive(Debug, Default)]
struct GateState {
    in_flight: Option<Operation>,
    hold_until: Option<Instant>,
}

/// Single-writer gate over the current step.
#[derive(Debug)]
pub struct SyncGate {
    state: Mutex<GateState>,
    hold: Duration,
}

impl SyncGate {
    pub fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            hold,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `op`, or fail with `Busy` if another operation is in flight.
    pub fn begin(self: &Arc<Self>, op: Operation) -> Result<OperationGuard, WizardError> {
        let mut state = self.lock();
        if let Some(current) = state.in_flight {
            return Err(WizardError::Busy { operation: current });
        }
        state.in_flight = Some(op);
        tracing::trace!(operation = %op, "Operation started");
        Ok(OperationGuard {
            gate: Arc::clone(self),
            op,
        })
    }

    pub fn in_flight(&self) -> Option<Operation> {
        self.lock().in_flight
    }

    /// Fail with `Busy` if any operation is in flight.
    pub fn ensure_idle(&self) -> Result<(), WizardError> {
        match self.in_flight() {
            Some(operation) => Err(WizardError::Busy { operation }),
            None => Ok(()),
        }
    }

    /// Record a user-driven step change.
    pub fn hold_after_navigation(&self) {
        self.lock().hold_until = Some(Instant::now() + self.hold);
    }

    pub fn manual_hold_active(&self) -> bool {
        let mut state = self.lock();
        match state.hold_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.hold_until = None;
                false
            }
            None => false,
        }
    }

    /// Suppression coming from the gate itself, ignoring wizard state.
    pub fn suppression(&self) -> Option<SuppressReason> {
        match self.in_flight() {
            Some(Operation::Complete) => return Some(SuppressReason::Completing),
            Some(Operation::StartCrawl) => return Some(SuppressReason::StartingCrawl),
            Some(op) => return Some(SuppressReason::OperationInFlight(op)),
            None => {}
        }
        self.manual_hold_active()
            .then_some(SuppressReason::ManualNavigation)
    }
}

/// Marks an operation in flight until dropped.
#[derive(Debug)]
pub struct OperationGuard {
    gate: Arc<SyncGate>,
    op: Operation,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        if state.in_flight == Some(self.op) {
            state.in_flight = None;
        }
        tracing::trace!(operation = %self.op, "Operation finished");
    }
}
