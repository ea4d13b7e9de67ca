//! OnboardingController owns the wizard state and runs every step's side
//! effect against the backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::crawl::{PollContext, spawn_crawl_poller};
use super::events::{StepOrigin, WizardEvent};
use super::model::{DataSourceForm, Organization};
use super::state::{CrawlPhase, WizardState, WizardStep};
use super::sync::{Operation, SuppressReason, SyncGate};
use crate::api::model::{OnboardingStatus, TestAnswer, TestQuery};
use crate::api::OnboardingApi;
use crate::cache::{CacheInvalidator, CacheTopic};
use crate::config::WizardConfig;
use crate::error::{ApiError, WizardError};

/// Result of one status sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The wizard moved to the given step.
    Applied(WizardStep),
    /// The remote status did not call for a move.
    Unchanged,
    /// Sync was not allowed to touch the current step.
    Suppressed(SuppressReason),
}

/// Coordinates the four-step onboarding wizard.
pub struct OnboardingController {
    api: Arc<dyn OnboardingApi>,
    cache: Arc<dyn CacheInvalidator>,
    config: WizardConfig,
    state: Arc<RwLock<WizardState>>,
    gate: Arc<SyncGate>,
    events: broadcast::Sender<WizardEvent>,
    crawl_generation: Arc<AtomicU64>,
    poller: Mutex<Option<JoinHandle<()>>>,
    status_sync: Mutex<Option<JoinHandle<()>>>,
}

impl OnboardingController {
    pub fn new(
        api: Arc<dyn OnboardingApi>,
        cache: Arc<dyn CacheInvalidator>,
        config: WizardConfig,
    ) -> Self {
        let (events, _rx) = broadcast::channel(config.event_capacity.max(1));
        Self {
            api,
            cache,
            gate: SyncGate::new(config.sync_hold),
            config,
            state: Arc::new(RwLock::new(WizardState::default())),
            events,
            crawl_generation: Arc::new(AtomicU64::new(0)),
            poller: Mutex::new(None),
            status_sync: Mutex::new(None),
        }
    }

    /// Subscribe to wizard events.
    pub fn subscribe(&self) -> broadcast::Receiver<WizardEvent> {
        self.events.subscribe()
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> WizardState {
        self.state.read().await.clone()
    }

    pub async fn current_step(&self) -> WizardStep {
        self.state.read().await.current_step
    }

    pub async fn crawl_phase(&self) -> CrawlPhase {
        self.state.read().await.crawl_phase
    }

    /// Operation currently in flight, if any.
    pub fn in_flight(&self) -> Option<Operation> {
        self.gate.in_flight()
    }

    /// Whether `next()` would currently be accepted, ignoring field validation.
    pub async fn can_advance(&self) -> bool {
        if self.gate.in_flight().is_some() {
            return false;
        }
        let state = self.state.read().await;
        match state.current_step {
            WizardStep::Branding | WizardStep::Project => true,
            WizardStep::DataSource => state.crawl_phase == CrawlPhase::Complete,
            WizardStep::Test => false,
        }
    }

    fn emit(&self, event: WizardEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn report<T>(&self, result: Result<T, WizardError>) -> Result<T, WizardError> {
        if let Err(ref e) = result {
            self.emit(WizardEvent::error(e.to_string()));
        }
        result
    }

    // ── Hydration & status sync ─────────────────────────────────────────

    /// Load the onboarding status and stored branding into a fresh wizard.
    /// Refused once the session has moved past step 1.
    pub async fn hydrate(&self) -> Result<WizardStep, WizardError> {
        let result = self.load_remote().await;
        self.report(result)
    }

    async fn load_remote(&self) -> Result<WizardStep, WizardError> {
        if self.state.read().await.furthest_step > WizardStep::Branding {
            return Err(WizardError::SessionInProgress);
        }
        let status = self.api.onboarding_status().await?;
        let branding = match self.api.get_branding().await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("Failed to load branding, starting with defaults: {e}");
                None
            }
        };

        let mut state = self.state.write().await;
        // The user may have advanced while the requests were in flight.
        if state.furthest_step > WizardStep::Branding {
            return Err(WizardError::SessionInProgress);
        }
        if let Some(ref branding) = branding {
            state.organization.merge_from(branding);
        }
        let from = state.current_step;
        let target = Self::absorb_remote(&mut state, &status);
        state.enter(target);
        drop(state);

        info!(step = %target, completed = ?status.completed_steps, "Onboarding hydrated");
        if target != from {
            self.emit(WizardEvent::StepChanged {
                from,
                to: target,
                origin: StepOrigin::Remote,
            });
            self.emit(WizardEvent::info(format!(
                "Resuming onboarding at step {} ({})",
                target.number(),
                target.title()
            )));
        }
        Ok(target)
    }

    /// Merge the remote status into local state and return the step the
    /// wizard may move to.
    fn absorb_remote(state: &mut WizardState, status: &OnboardingStatus) -> WizardStep {
        for key in &status.completed_steps {
            match WizardStep::from_key(key) {
                Some(step) => state.mark_completed(step),
                None => debug!(key = %key, "Ignoring unknown completed step"),
            }
        }
        if state.project.id.is_none() {
            if let Some(ref id) = status.project_id {
                state.project.id = Some(id.clone());
            }
        }
        if state.is_completed(WizardStep::DataSource) && state.crawl_phase == CrawlPhase::Idle {
            state.crawl_phase = CrawlPhase::Complete;
        }
        let requested = WizardStep::from_key(&status.current_step).unwrap_or_else(|| {
            warn!(step = %status.current_step, "Unknown remote step, staying put");
            state.current_step
        });
        state.reachable(requested)
    }

    /// Why sync may not move the wizard right now, if anything.
    fn suppression(&self, state: &WizardState) -> Option<SuppressReason> {
        if let Some(reason) = self.gate.suppression() {
            return Some(reason);
        }
        match state.crawl_phase {
            CrawlPhase::Creating => Some(SuppressReason::StartingCrawl),
            CrawlPhase::Crawling => Some(SuppressReason::CrawlRunning),
            CrawlPhase::Complete if state.current_step == WizardStep::DataSource => {
                Some(SuppressReason::AwaitingNext)
            }
            _ => None,
        }
    }

    /// Re-read the onboarding status and follow it if nothing suppresses
    /// sync. Remote status only moves the wizard forward past the furthest
    /// step this session reached, so it can resume a session advanced
    /// elsewhere without undoing the user's own Back navigation.
    pub async fn sync_from_remote(&self) -> Result<SyncOutcome, WizardError> {
        {
            let state = self.state.read().await;
            if state.finished {
                return Ok(SyncOutcome::Unchanged);
            }
            if let Some(reason) = self.suppression(&state) {
                debug!(?reason, "Status sync suppressed");
                return Ok(SyncOutcome::Suppressed(reason));
            }
        }

        let status = self.api.onboarding_status().await?;

        // The user may have acted while the request was in flight.
        let mut state = self.state.write().await;
        if state.finished {
            return Ok(SyncOutcome::Unchanged);
        }
        if let Some(reason) = self.suppression(&state) {
            debug!(?reason, "Status sync suppressed after fetch");
            return Ok(SyncOutcome::Suppressed(reason));
        }

        let target = Self::absorb_remote(&mut state, &status);
        if target <= state.furthest_step || target == state.current_step {
            return Ok(SyncOutcome::Unchanged);
        }

        let from = state.current_step;
        state.enter(target);
        drop(state);

        if from == WizardStep::DataSource {
            self.stop_poller();
        }
        info!(%from, to = %target, "Applied remote onboarding step");
        self.emit(WizardEvent::StepChanged {
            from,
            to: target,
            origin: StepOrigin::Remote,
        });
        Ok(SyncOutcome::Applied(target))
    }

    /// Run `sync_from_remote` on an interval until the controller is dropped
    /// or onboarding finishes.
    pub fn spawn_status_sync(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.status_sync_interval;
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(controller) = weak.upgrade() else {
                    return;
                };
                match controller.sync_from_remote().await {
                    Ok(_) => {}
                    Err(e) => debug!("Status sync failed: {e}"),
                }
                if controller.state.read().await.finished {
                    return;
                }
            }
        });
        let mut slot = self.status_sync.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    // ── Form edits ──────────────────────────────────────────────────────

    pub async fn update_organization(&self, organization: Organization) -> Result<(), WizardError> {
        self.gate.ensure_idle()?;
        self.state.write().await.organization = organization;
        Ok(())
    }

    pub async fn update_project(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<(), WizardError> {
        self.gate.ensure_idle()?;
        let mut state = self.state.write().await;
        state.project.name = name.into();
        state.project.description = description.into();
        Ok(())
    }

    pub async fn update_data_source(&self, form: DataSourceForm) -> Result<(), WizardError> {
        self.gate.ensure_idle()?;
        let mut state = self.state.write().await;
        if state.crawl_phase.is_in_progress() {
            return Err(WizardError::CrawlInProgress);
        }
        // Restarts reuse the existing record, so edits would never reach it.
        if let Some(ref id) = state.data_source.id {
            if !state.data_source.matches(&form) {
                return Err(WizardError::DataSourceLocked { id: id.clone() });
            }
        }
        state.data_source.apply(form);
        Ok(())
    }

    // ── Navigation ──────────────────────────────────────────────────────

    /// Run the current step's side effect and move forward.
    pub async fn next(&self) -> Result<WizardStep, WizardError> {
        let step = self.current_step().await;
        let result = match step {
            WizardStep::Branding => self.submit_branding().await,
            WizardStep::Project => self.submit_project().await,
            WizardStep::DataSource => self.leave_data_source().await,
            WizardStep::Test => Err(WizardError::AtLastStep),
        };
        self.report(result)
    }

    /// Go back one step. Never validates; refused while an operation runs.
    pub async fn back(&self) -> Result<WizardStep, WizardError> {
        let result = self.step_back().await;
        self.report(result)
    }

    async fn step_back(&self) -> Result<WizardStep, WizardError> {
        self.gate.ensure_idle()?;
        let mut state = self.state.write().await;
        if state.finished {
            return Err(WizardError::AlreadyCompleted);
        }
        let from = state.current_step;
        let to = from.previous().ok_or(WizardError::AtFirstStep)?;

        let mut crawl_reset = false;
        if from == WizardStep::DataSource {
            self.stop_poller();
            if state.crawl_phase == CrawlPhase::Crawling {
                state.crawl_phase = CrawlPhase::Idle;
                crawl_reset = true;
            }
        }
        state.enter(to);
        self.gate.hold_after_navigation();
        drop(state);

        info!(%from, %to, "Stepped back");
        if crawl_reset {
            self.emit(WizardEvent::CrawlPhaseChanged {
                phase: CrawlPhase::Idle,
                status: None,
            });
        }
        self.emit(WizardEvent::StepChanged {
            from,
            to,
            origin: StepOrigin::User,
        });
        Ok(to)
    }

    /// Move from `from` to the following step after its side effect succeeded.
    async fn advance_from(&self, from: WizardStep) -> Result<WizardStep, WizardError> {
        let to = from.next().ok_or(WizardError::AtLastStep)?;
        let mut state = self.state.write().await;
        if state.current_step != from {
            return Err(WizardError::NotOnStep {
                expected: from,
                actual: state.current_step,
            });
        }
        // Checked again under the lock: a re-crawl may have started since
        // the caller looked.
        if from == WizardStep::DataSource && state.crawl_phase != CrawlPhase::Complete {
            return Err(WizardError::CrawlNotComplete);
        }
        state.mark_completed(from);
        state.enter(to);
        self.gate.hold_after_navigation();
        drop(state);

        info!(%from, %to, "Advanced onboarding step");
        self.emit(WizardEvent::StepChanged {
            from,
            to,
            origin: StepOrigin::User,
        });
        Ok(to)
    }

    async fn submit_branding(&self) -> Result<WizardStep, WizardError> {
        let _guard = self.gate.begin(Operation::SaveBranding)?;
        let organization = self.state.read().await.organization.clone();
        organization.validate()?;

        let update = organization.to_update();
        self.api.save_branding(&update).await?;
        let stored = self.api.get_branding().await?;
        Organization::verify_saved(&update, &stored)?;
        self.cache.invalidate(CacheTopic::Branding);
        info!(org = %update.org_name, "Branding saved");

        self.advance_from(WizardStep::Branding).await
    }

    async fn submit_project(&self) -> Result<WizardStep, WizardError> {
        let _guard = self.gate.begin(Operation::CreateProject)?;
        let draft = self.state.read().await.project.clone();

        if let Some(ref id) = draft.id {
            debug!(project = %id, "Project already created, not creating another");
            return self.advance_from(WizardStep::Project).await;
        }
        draft.validate()?;

        let record = self.api.create_project(&draft.to_new()).await?;
        if record.id.trim().is_empty() {
            return Err(ApiError::InvalidResponse {
                endpoint: "create project".into(),
                reason: "missing project id".into(),
            }
            .into());
        }
        self.state.write().await.project.id = Some(record.id.clone());
        self.cache.invalidate(CacheTopic::Projects);
        info!(project = %record.id, name = %record.name, "Project created");

        self.advance_from(WizardStep::Project).await
    }

    async fn leave_data_source(&self) -> Result<WizardStep, WizardError> {
        self.gate.ensure_idle()?;
        if self.crawl_phase().await != CrawlPhase::Complete {
            return Err(WizardError::CrawlNotComplete);
        }
        let to = self.advance_from(WizardStep::DataSource).await?;
        self.stop_poller();
        Ok(to)
    }

    // ── Crawl ───────────────────────────────────────────────────────────

    /// Create the data source (first time only), start its crawl, and begin
    /// polling for completion.
    pub async fn start_crawl(&self) -> Result<(), WizardError> {
        let result = self.begin_crawl().await;
        self.report(result)
    }

    async fn begin_crawl(&self) -> Result<(), WizardError> {
        let _guard = self.gate.begin(Operation::StartCrawl)?;

        let (project_id, draft) = {
            let mut state = self.state.write().await;
            if state.current_step != WizardStep::DataSource {
                return Err(WizardError::NotOnStep {
                    expected: WizardStep::DataSource,
                    actual: state.current_step,
                });
            }
            let project_id = state.project.id.clone().ok_or(WizardError::MissingProject)?;
            if state.crawl_phase.is_in_progress() {
                return Err(WizardError::CrawlInProgress);
            }
            state.data_source.validate()?;
            state.crawl_phase = CrawlPhase::Creating;
            state.crawl_status = None;
            (project_id, state.data_source.clone())
        };
        self.emit(WizardEvent::CrawlPhaseChanged {
            phase: CrawlPhase::Creating,
            status: None,
        });

        let data_source_id = match self.create_and_start(&project_id, draft.id).await {
            Ok(id) => id,
            Err(e) => {
                self.state.write().await.crawl_phase = CrawlPhase::Idle;
                self.emit(WizardEvent::CrawlPhaseChanged {
                    phase: CrawlPhase::Idle,
                    status: None,
                });
                return Err(e);
            }
        };

        self.state.write().await.crawl_phase = CrawlPhase::Crawling;
        self.emit(WizardEvent::CrawlPhaseChanged {
            phase: CrawlPhase::Crawling,
            status: None,
        });
        info!(data_source = %data_source_id, "Crawl started");

        self.spawn_poller(data_source_id);
        Ok(())
    }

    /// Reuse the existing data source or create one, then trigger the crawl.
    async fn create_and_start(
        &self,
        project_id: &str,
        existing: Option<String>,
    ) -> Result<String, WizardError> {
        let data_source_id = match existing {
            Some(id) => {
                debug!(data_source = %id, "Reusing existing data source");
                id
            }
            None => {
                let new_source = self.state.read().await.data_source.to_new();
                let record = self.api.create_data_source(project_id, &new_source).await?;
                if record.id.trim().is_empty() {
                    return Err(ApiError::InvalidResponse {
                        endpoint: "create data source".into(),
                        reason: "missing data source id".into(),
                    }
                    .into());
                }
                // Stored before the crawl starts so a failed start is retried
                // against the same data source.
                self.state.write().await.data_source.id = Some(record.id.clone());
                self.cache.invalidate(CacheTopic::CrawlSites);
                info!(data_source = %record.id, url = %new_source.base_url, "Data source created");
                record.id
            }
        };

        self.api.start_crawl(&data_source_id).await?;
        Ok(data_source_id)
    }

    fn spawn_poller(&self, data_source_id: String) {
        let generation = self.crawl_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = spawn_crawl_poller(PollContext {
            api: Arc::clone(&self.api),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            data_source_id,
            generation,
            current_generation: Arc::clone(&self.crawl_generation),
            interval: self.config.poll_interval,
            timeout: self.config.crawl_timeout,
        });
        let mut slot = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Stop polling and invalidate any result a running poller may still
    /// deliver.
    fn stop_poller(&self) {
        self.crawl_generation.fetch_add(1, Ordering::SeqCst);
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Crawl poller stopped");
        }
    }

    /// Whether a crawl poller task is alive.
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    // ── Step 4 ──────────────────────────────────────────────────────────

    /// Run a retrieval query against the new project.
    pub async fn run_test_query(&self, query: &str) -> Result<TestAnswer, WizardError> {
        let result = self.test_query(query).await;
        self.report(result)
    }

    async fn test_query(&self, query: &str) -> Result<TestAnswer, WizardError> {
        let _guard = self.gate.begin(Operation::TestQuery)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(WizardError::validation("query", "is required"));
        }
        let project_id = {
            let state = self.state.read().await;
            if state.current_step != WizardStep::Test {
                return Err(WizardError::NotOnStep {
                    expected: WizardStep::Test,
                    actual: state.current_step,
                });
            }
            state.project.id.clone().ok_or(WizardError::MissingProject)?
        };

        let answer = self
            .api
            .test_query(&TestQuery {
                project_id,
                query: query.to_string(),
            })
            .await?;

        let mut state = self.state.write().await;
        state.test_query = Some(query.to_string());
        state.test_response = Some(answer.answer.clone());
        Ok(answer)
    }

    /// Mark onboarding complete, drop cached reads, and redirect.
    pub async fn finish(&self) -> Result<(), WizardError> {
        let result = self.complete().await;
        self.report(result)
    }

    async fn complete(&self) -> Result<(), WizardError> {
        let _guard = self.gate.begin(Operation::Complete)?;
        {
            let state = self.state.read().await;
            if state.finished {
                return Err(WizardError::AlreadyCompleted);
            }
            if state.current_step != WizardStep::Test {
                return Err(WizardError::NotOnStep {
                    expected: WizardStep::Test,
                    actual: state.current_step,
                });
            }
        }

        self.api.complete_onboarding().await?;
        self.cache.invalidate_all();

        {
            let mut state = self.state.write().await;
            state.finished = true;
            state.mark_completed(WizardStep::Test);
        }
        self.shutdown();

        info!(to = %self.config.redirect_to, "Onboarding complete");
        self.emit(WizardEvent::Redirect {
            to: self.config.redirect_to.clone(),
        });
        Ok(())
    }

    /// Stop background tasks. Called automatically on drop.
    pub fn shutdown(&self) {
        self.stop_poller();
        let handle = self
            .status_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for OnboardingController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::{Endpoint, MemoryBackend};
    use crate::cache::RecordingInvalidator;
    use crate::onboarding::model::ProjectDraft;

    fn controller_with(backend: Arc<MemoryBackend>) -> (OnboardingController, Arc<RecordingInvalidator>) {
        let cache = Arc::new(RecordingInvalidator::default());
        let controller = OnboardingController::new(backend, cache.clone(), WizardConfig::default());
        (controller, cache)
    }

    /// Drive a controller to step 3 with a project created.
    async fn at_data_source(backend: Arc<MemoryBackend>) -> (OnboardingController, Arc<RecordingInvalidator>) {
        let (controller, cache) = controller_with(backend);
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();
        controller.next().await.unwrap();
        controller.update_project("Docs", "desc").await.unwrap();
        controller.next().await.unwrap();
        controller
            .update_data_source(DataSourceForm::new("https://x.com"))
            .await
            .unwrap();
        (controller, cache)
    }

    async fn wait_for_phase(
        rx: &mut broadcast::Receiver<WizardEvent>,
        wanted: CrawlPhase,
    ) {
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                if let WizardEvent::CrawlPhaseChanged { phase, .. } = rx.recv().await.unwrap() {
                    if phase == wanted {
                        return;
                    }
                }
            }
        })
        .await
        .expect("crawl phase never reached");
    }

    #[tokio::test]
    async fn branding_requires_name_without_network() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());

        let err = controller.next().await.unwrap_err();
        assert!(matches!(err, WizardError::Validation { .. }));
        assert_eq!(controller.current_step().await, WizardStep::Branding);
        assert_eq!(backend.calls(Endpoint::SaveBranding), 0);
    }

    #[tokio::test]
    async fn branding_failure_stays_on_step_and_notifies() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        let mut rx = controller.subscribe();
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();

        backend.fail_next(Endpoint::SaveBranding);
        assert!(controller.next().await.is_err());
        assert_eq!(controller.current_step().await, WizardStep::Branding);
        assert!(matches!(rx.recv().await.unwrap(), WizardEvent::Notice { .. }));

        // Retry succeeds
        assert_eq!(controller.next().await.unwrap(), WizardStep::Project);
    }

    #[tokio::test(start_paused = true)]
    async fn branding_read_back_mismatch_blocks_advance() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();

        // The save lands, then another writer changes branding before the
        // read-back returns.
        backend.set_delay(Endpoint::GetBranding, Duration::from_secs(2));
        let clobber = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            backend.set_branding(crate::api::Branding {
                org_name: Some("Someone else".into()),
                ..Default::default()
            });
        };
        let (result, ()) = tokio::join!(controller.next(), clobber);
        assert!(matches!(
            result,
            Err(WizardError::ReadAfterWrite { field: "org_name" })
        ));
        assert_eq!(controller.current_step().await, WizardStep::Branding);
    }

    #[tokio::test]
    async fn project_creation_sets_id_and_invalidates_projects() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, cache) = controller_with(backend.clone());
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();
        controller.next().await.unwrap();

        controller.update_project("Docs", "").await.unwrap();
        assert!(controller.next().await.is_err());
        assert_eq!(backend.calls(Endpoint::CreateProject), 0);

        controller.update_project("Docs", "desc").await.unwrap();
        assert_eq!(controller.next().await.unwrap(), WizardStep::DataSource);
        let state = controller.snapshot().await;
        assert!(state.project.id.is_some());
        assert!(cache.topics().contains(&CacheTopic::Projects));
    }

    #[tokio::test]
    async fn back_from_project_skips_validation() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend);
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();
        controller.next().await.unwrap();
        controller.update_project("", "").await.unwrap();

        assert_eq!(controller.back().await.unwrap(), WizardStep::Branding);
        assert!(matches!(controller.back().await, Err(WizardError::AtFirstStep)));
    }

    #[tokio::test]
    async fn returning_to_project_does_not_create_twice() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend.clone()).await;
        let id = controller.snapshot().await.project.id;

        controller.back().await.unwrap();
        assert_eq!(controller.next().await.unwrap(), WizardStep::DataSource);
        assert_eq!(backend.project_count(), 1);
        assert_eq!(controller.snapshot().await.project.id, id);
    }

    #[tokio::test]
    async fn next_on_step_three_requires_complete_crawl() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend).await;
        assert!(!controller.can_advance().await);
        assert!(matches!(
            controller.next().await,
            Err(WizardError::CrawlNotComplete)
        ));
        assert_eq!(controller.current_step().await, WizardStep::DataSource);
    }

    #[tokio::test(start_paused = true)]
    async fn crawl_completes_and_waits_for_next() {
        let backend = Arc::new(
            MemoryBackend::new().with_crawl_statuses(["queued", "crawling", "crawl finished"]),
        );
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();

        controller.start_crawl().await.unwrap();
        assert_eq!(controller.crawl_phase().await, CrawlPhase::Crawling);

        wait_for_phase(&mut rx, CrawlPhase::Complete).await;
        assert_eq!(backend.calls(Endpoint::CrawlStatus), 3);
        // No automatic advance.
        assert_eq!(controller.current_step().await, WizardStep::DataSource);
        assert!(controller.can_advance().await);
        assert_eq!(controller.next().await.unwrap(), WizardStep::Test);
    }

    #[tokio::test(start_paused = true)]
    async fn start_crawl_reuses_data_source() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["failed"]));
        let (controller, cache) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();

        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Failed).await;
        let first_id = controller.snapshot().await.data_source.id;
        assert!(first_id.is_some());

        controller.start_crawl().await.unwrap();
        assert_eq!(backend.calls(Endpoint::CreateDataSource), 1);
        assert_eq!(backend.calls(Endpoint::StartCrawl), 2);
        assert_eq!(controller.snapshot().await.data_source.id, first_id);
        assert_eq!(
            cache.topics().iter().filter(|t| **t == CacheTopic::CrawlSites).count(),
            1
        );
    }

    #[tokio::test]
    async fn start_crawl_failure_returns_to_idle_and_keeps_id() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend.clone()).await;

        backend.fail_next(Endpoint::StartCrawl);
        assert!(controller.start_crawl().await.is_err());
        let state = controller.snapshot().await;
        assert_eq!(state.crawl_phase, CrawlPhase::Idle);
        assert!(state.data_source.id.is_some());
        assert!(!controller.is_polling());

        controller.start_crawl().await.unwrap();
        assert_eq!(backend.calls(Endpoint::CreateDataSource), 1);
        assert_eq!(controller.crawl_phase().await, CrawlPhase::Crawling);
    }

    #[tokio::test]
    async fn start_crawl_validates_url() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend.clone()).await;
        controller
            .update_data_source(DataSourceForm::new(""))
            .await
            .unwrap();
        assert!(matches!(
            controller.start_crawl().await,
            Err(WizardError::Validation { .. })
        ));
        assert_eq!(controller.crawl_phase().await, CrawlPhase::Idle);
        assert_eq!(backend.calls(Endpoint::CreateDataSource), 0);
    }

    #[tokio::test]
    async fn start_crawl_while_crawling_is_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend.clone()).await;
        controller.start_crawl().await.unwrap();
        assert!(matches!(
            controller.start_crawl().await,
            Err(WizardError::CrawlInProgress)
        ));
        assert!(matches!(
            controller
                .update_data_source(DataSourceForm::new("https://y.com"))
                .await,
            Err(WizardError::CrawlInProgress)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn source_settings_locked_once_created() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["failed"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();
        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Failed).await;

        let err = controller
            .update_data_source(DataSourceForm::new("https://right.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, WizardError::DataSourceLocked { .. }));
        assert_eq!(
            controller.snapshot().await.data_source.source_url,
            "https://x.com"
        );

        // Same settings again are accepted; the restart reuses the record.
        controller
            .update_data_source(DataSourceForm::new("https://x.com"))
            .await
            .unwrap();
        controller.start_crawl().await.unwrap();
        assert_eq!(backend.calls(Endpoint::CreateDataSource), 1);
        assert_eq!(backend.calls(Endpoint::StartCrawl), 2);
    }

    #[tokio::test]
    async fn advance_rechecks_crawl_phase_under_lock() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend).await;
        // A re-crawl started after the caller saw a completed crawl.
        controller.state.write().await.crawl_phase = CrawlPhase::Creating;

        assert!(matches!(
            controller.advance_from(WizardStep::DataSource).await,
            Err(WizardError::CrawlNotComplete)
        ));
        let state = controller.snapshot().await;
        assert_eq!(state.current_step, WizardStep::DataSource);
        assert!(!state.is_completed(WizardStep::DataSource));
    }

    #[tokio::test(start_paused = true)]
    async fn back_from_step_three_stops_polling() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["running"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        controller.start_crawl().await.unwrap();
        assert!(controller.is_polling());

        controller.back().await.unwrap();
        assert!(!controller.is_polling());
        assert_eq!(controller.crawl_phase().await, CrawlPhase::Idle);

        let polls = backend.calls(Endpoint::CrawlStatus);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls(Endpoint::CrawlStatus), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn back_from_test_keeps_completed_crawl() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["done"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();
        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Complete).await;
        controller.next().await.unwrap();

        assert_eq!(controller.back().await.unwrap(), WizardStep::DataSource);
        assert_eq!(controller.crawl_phase().await, CrawlPhase::Complete);
        assert_eq!(controller.next().await.unwrap(), WizardStep::Test);
        assert_eq!(backend.calls(Endpoint::StartCrawl), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_crawl_stops_polling() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["crawling"]));
        let cache = Arc::new(RecordingInvalidator::default());
        let config = WizardConfig {
            crawl_timeout: Duration::from_secs(30),
            ..WizardConfig::default()
        };
        let controller = OnboardingController::new(backend.clone(), cache, config);
        controller.update_organization(Organization::new("Acme")).await.unwrap();
        controller.next().await.unwrap();
        controller.update_project("Docs", "desc").await.unwrap();
        controller.next().await.unwrap();
        controller
            .update_data_source(DataSourceForm::new("https://x.com"))
            .await
            .unwrap();
        let mut rx = controller.subscribe();

        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Stalled).await;
        assert!(backend.calls(Endpoint::CrawlStatus) >= 9);
        assert!(!controller.can_advance().await);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_are_retried_silently() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["done"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();

        backend.fail_next(Endpoint::CrawlStatus);
        controller.start_crawl().await.unwrap();
        tokio::time::timeout(Duration::from_secs(3600), async {
            loop {
                match rx.recv().await.unwrap() {
                    WizardEvent::Notice { message, .. } => panic!("unexpected notice: {message}"),
                    WizardEvent::CrawlPhaseChanged {
                        phase: CrawlPhase::Complete,
                        ..
                    } => return,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(backend.calls(Endpoint::CrawlStatus), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_suppressed_while_crawling() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["running"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        controller.start_crawl().await.unwrap();

        backend.override_status(OnboardingStatus {
            current_step: "test".into(),
            completed_steps: vec!["branding".into(), "project".into(), "data_source".into()],
            project_id: None,
        });
        // Let the navigation hold from step 2 lapse so only the crawl suppresses.
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(
            controller.sync_from_remote().await.unwrap(),
            SyncOutcome::Suppressed(SuppressReason::CrawlRunning)
        );
        assert_eq!(controller.current_step().await, WizardStep::DataSource);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_suppressed_while_completed_crawl_awaits_next() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["done"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();
        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Complete).await;

        backend.override_status(OnboardingStatus {
            current_step: "test".into(),
            completed_steps: vec!["data_source".into()],
            project_id: None,
        });
        assert_eq!(
            controller.sync_from_remote().await.unwrap(),
            SyncOutcome::Suppressed(SuppressReason::AwaitingNext)
        );
        assert_eq!(controller.current_step().await, WizardStep::DataSource);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_suppressed_right_after_navigation() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        controller.update_organization(Organization::new("Acme")).await.unwrap();
        controller.next().await.unwrap();
        controller.back().await.unwrap();

        backend.override_status(OnboardingStatus {
            current_step: "data_source".into(),
            completed_steps: vec!["branding".into(), "project".into()],
            project_id: Some("proj_elsewhere".into()),
        });
        assert_eq!(
            controller.sync_from_remote().await.unwrap(),
            SyncOutcome::Suppressed(SuppressReason::ManualNavigation)
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(
            controller.sync_from_remote().await.unwrap(),
            SyncOutcome::Applied(WizardStep::DataSource)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sync_does_not_undo_back_navigation() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        controller.update_organization(Organization::new("Acme")).await.unwrap();
        controller.next().await.unwrap();
        controller.back().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        // Backend says "project", which this session already reached.
        assert_eq!(
            controller.sync_from_remote().await.unwrap(),
            SyncOutcome::Unchanged
        );
        assert_eq!(controller.current_step().await, WizardStep::Branding);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_suppressed_while_completing() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["done"]));
        let (controller, _) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();
        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Complete).await;
        controller.next().await.unwrap();

        backend.set_delay(Endpoint::CompleteOnboarding, Duration::from_secs(5));
        let finishing = controller.finish();
        let probing = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            controller.sync_from_remote().await.unwrap()
        };
        let (finished, outcome) = tokio::join!(finishing, probing);
        finished.unwrap();
        assert_eq!(outcome, SyncOutcome::Suppressed(SuppressReason::Completing));
    }

    #[tokio::test]
    async fn hydrate_resumes_and_clamps_to_prerequisites() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_branding(crate::api::Branding {
            org_name: Some("Acme".into()),
            logo_data_url: None,
            primary_color: Some("#111111".into()),
        });
        backend.override_status(OnboardingStatus {
            current_step: "test".into(),
            completed_steps: vec!["branding".into(), "project".into()],
            project_id: Some("proj_1".into()),
        });
        let (controller, _) = controller_with(backend);
        let mut rx = controller.subscribe();

        // data_source is not complete remotely, so the wizard resumes on step 3.
        assert_eq!(controller.hydrate().await.unwrap(), WizardStep::DataSource);
        assert!(matches!(
            rx.recv().await.unwrap(),
            WizardEvent::StepChanged {
                to: WizardStep::DataSource,
                origin: StepOrigin::Remote,
                ..
            }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            WizardEvent::Notice {
                level: crate::onboarding::NoticeLevel::Info,
                ..
            }
        ));
        let state = controller.snapshot().await;
        assert_eq!(state.organization.name, "Acme");
        assert_eq!(state.organization.primary_color, "#111111");
        assert_eq!(state.project.id.as_deref(), Some("proj_1"));
        assert!(state.is_completed(WizardStep::Project));
    }

    #[tokio::test]
    async fn hydrate_refused_once_session_moved_on() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        controller
            .update_organization(Organization::new("Acme"))
            .await
            .unwrap();
        controller.next().await.unwrap();
        let mut rx = controller.subscribe();

        assert!(matches!(
            controller.hydrate().await,
            Err(WizardError::SessionInProgress)
        ));
        assert_eq!(controller.current_step().await, WizardStep::Project);
        assert_eq!(backend.calls(Endpoint::OnboardingStatus), 0);
        assert!(matches!(
            rx.recv().await.unwrap(),
            WizardEvent::Notice { .. }
        ));
    }

    #[tokio::test]
    async fn hydrate_failure_notifies() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        let mut rx = controller.subscribe();

        backend.fail_next(Endpoint::OnboardingStatus);
        assert!(controller.hydrate().await.is_err());
        assert!(matches!(
            rx.recv().await.unwrap(),
            WizardEvent::Notice {
                level: crate::onboarding::NoticeLevel::Error,
                ..
            }
        ));

        // Nothing was applied, so a retry is allowed.
        assert_eq!(controller.hydrate().await.unwrap(), WizardStep::Branding);
    }

    #[tokio::test]
    async fn hydrate_without_project_stays_before_data_source() {
        let backend = Arc::new(MemoryBackend::new());
        backend.override_status(OnboardingStatus {
            current_step: "data_source".into(),
            completed_steps: vec![],
            project_id: None,
        });
        let (controller, _) = controller_with(backend);
        assert_eq!(controller.hydrate().await.unwrap(), WizardStep::Project);
    }

    #[tokio::test]
    async fn test_query_requires_step_four() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = at_data_source(backend.clone()).await;
        assert!(matches!(
            controller.run_test_query("hello").await,
            Err(WizardError::NotOnStep { .. })
        ));
        assert_eq!(backend.calls(Endpoint::TestQuery), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn finish_failure_is_retryable() {
        let backend = Arc::new(MemoryBackend::new().with_crawl_statuses(["done"]));
        let (controller, cache) = at_data_source(backend.clone()).await;
        let mut rx = controller.subscribe();
        controller.start_crawl().await.unwrap();
        wait_for_phase(&mut rx, CrawlPhase::Complete).await;
        controller.next().await.unwrap();

        backend.fail_next(Endpoint::CompleteOnboarding);
        assert!(controller.finish().await.is_err());
        assert!(!controller.snapshot().await.finished);
        assert_eq!(controller.current_step().await, WizardStep::Test);

        controller.finish().await.unwrap();
        assert!(controller.snapshot().await.finished);
        assert!(cache.topics().len() >= CacheTopic::ALL.len());
        assert!(matches!(
            controller.finish().await,
            Err(WizardError::AlreadyCompleted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn edits_rejected_while_busy() {
        let backend = Arc::new(MemoryBackend::new());
        let (controller, _) = controller_with(backend.clone());
        controller.update_organization(Organization::new("Acme")).await.unwrap();
        backend.set_delay(Endpoint::SaveBranding, Duration::from_millis(50));

        let saving = controller.next();
        let editing = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            (
                controller.update_project("Docs", "desc").await,
                controller.back().await,
            )
        };
        let (saved, (edit, back)) = tokio::join!(saving, editing);
        assert_eq!(saved.unwrap(), WizardStep::Project);
        assert!(matches!(edit, Err(WizardError::Busy { .. })));
        assert!(matches!(back, Err(WizardError::Busy { .. })));
        assert_eq!(controller.snapshot().await.project, ProjectDraft::default());
    }
}
