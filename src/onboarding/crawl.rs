//! Crawl status classification and the background status poller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::events::WizardEvent;
use super::state::{CrawlPhase, WizardState, WizardStep};
use crate::api::OnboardingApi;

/// Structured view of the crawl service's free-text status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl CrawlStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Words and the punctuation that ends a clause.
static TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z]+(?:'[a-z]+)?|[.,;:!?()]").unwrap());

const SUCCESS_WORDS: &[&str] = &[
    "complete",
    "completed",
    "done",
    "success",
    "succeeded",
    "successful",
    "successfully",
    "finished",
];

const FAILURE_WORDS: &[&str] = &[
    "failed", "failure", "error", "errored", "aborted", "cancelled", "canceled",
];

const PENDING_WORDS: &[&str] = &["queued", "pending", "waiting", "scheduled"];

const NEGATORS: &[&str] = &[
    "not", "no", "never", "yet", "isn't", "isnt", "hasn't", "hasnt", "wasn't", "wasnt",
    "haven't", "havent", "didn't", "didnt", "aren't", "arent", "without",
];

/// Words that start a new clause and end the reach of a negator.
const CONJUNCTIONS: &[&str] = &["but", "and", "or", "then", "so", "although", "though"];

/// Classify a crawl status string.
///
/// Matching is case-insensitive and on whole words, so "incomplete" and
/// "unsuccessful" are not success words. A negator covers the rest of its
/// clause, up to punctuation or a conjunction, so "not yet done" and "was not
/// successfully completed" stay running while "no errors, crawl complete"
/// succeeds. Failure words win over success words ("failed to complete");
/// plural "errors" is not a failure word so "completed with 3 errors" still
/// counts as done.
pub fn classify_status(status: &str) -> CrawlStatus {
    let lower = status.to_lowercase();

    let mut failed = false;
    let mut succeeded = false;
    let mut pending = false;
    let mut negated = false;
    for token in TOKENS.find_iter(&lower).map(|m| m.as_str()) {
        if !token.starts_with(|c: char| c.is_ascii_lowercase()) || CONJUNCTIONS.contains(&token)
        {
            negated = false;
        } else if NEGATORS.contains(&token) {
            negated = true;
        } else if !negated {
            failed |= FAILURE_WORDS.contains(&token);
            succeeded |= SUCCESS_WORDS.contains(&token);
            pending |= PENDING_WORDS.contains(&token);
        }
    }

    if failed {
        CrawlStatus::Failed
    } else if succeeded {
        CrawlStatus::Succeeded
    } else if pending {
        CrawlStatus::Pending
    } else {
        CrawlStatus::Running
    }
}

/// What a poller needs to do its job without holding the controller.
pub(crate) struct PollContext {
    pub api: Arc<dyn OnboardingApi>,
    pub state: Arc<RwLock<WizardState>>,
    pub events: broadcast::Sender<WizardEvent>,
    pub data_source_id: String,
    /// Generation this poller belongs to; results are dropped once the
    /// controller's current generation moves on.
    pub generation: u64,
    pub current_generation: Arc<AtomicU64>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollContext {
    fn is_current(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) == self.generation
    }

    /// Move the crawl out of `Crawling`. Returns false if this poller is
    /// stale or the phase already moved.
    async fn settle(&self, phase: CrawlPhase, status: Option<String>) -> bool {
        let mut state = self.state.write().await;
        if !self.is_current()
            || state.crawl_phase != CrawlPhase::Crawling
            || !state.crawl_phase.can_transition_to(phase)
        {
            debug!(
                generation = self.generation,
                phase = %state.crawl_phase,
                "Dropping result from stale crawl poller"
            );
            return false;
        }
        state.crawl_phase = phase;
        if status.is_some() {
            state.crawl_status = status.clone();
        }
        if phase == CrawlPhase::Complete {
            state.mark_completed(WizardStep::DataSource);
        }
        drop(state);

        let _ = self.events.send(WizardEvent::CrawlPhaseChanged { phase, status });
        true
    }

    async fn record_status(&self, status: &str) {
        let mut state = self.state.write().await;
        if self.is_current() && state.crawl_status.as_deref() != Some(status) {
            state.crawl_status = Some(status.to_string());
            drop(state);
            let _ = self.events.send(WizardEvent::CrawlPhaseChanged {
                phase: CrawlPhase::Crawling,
                status: Some(status.to_string()),
            });
        }
    }
}

/// Spawn a task that polls crawl status until it reaches a terminal state,
/// the timeout passes, or the task is aborted.
pub(crate) fn spawn_crawl_poller(ctx: PollContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            data_source = %ctx.data_source_id,
            interval_ms = ctx.interval.as_millis() as u64,
            "Crawl poller started"
        );

        let started = Instant::now();
        let mut tick = tokio::time::interval(ctx.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate; the first poll happens one interval in.
        tick.tick().await;

        loop {
            tick.tick().await;

            if !ctx.is_current() {
                return;
            }

            if started.elapsed() >= ctx.timeout {
                warn!(
                    data_source = %ctx.data_source_id,
                    timeout_secs = ctx.timeout.as_secs(),
                    "Crawl is taking longer than expected; polling stopped"
                );
                ctx.settle(CrawlPhase::Stalled, None).await;
                return;
            }

            let status = match ctx.api.crawl_status(&ctx.data_source_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(data_source = %ctx.data_source_id, "Crawl status poll failed: {e}");
                    continue;
                }
            };

            let classified = classify_status(&status);
            if !classified.is_terminal() {
                debug!(data_source = %ctx.data_source_id, status = %status, "Crawl still running");
                ctx.record_status(&status).await;
                continue;
            }

            if classified == CrawlStatus::Succeeded {
                if ctx.settle(CrawlPhase::Complete, Some(status)).await {
                    info!(data_source = %ctx.data_source_id, "Crawl complete");
                }
            } else if ctx.settle(CrawlPhase::Failed, Some(status.clone())).await {
                warn!(data_source = %ctx.data_source_id, status = %status, "Crawl failed");
            }
            return;
        }
    })
}
