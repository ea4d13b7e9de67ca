//! In-process backend that keeps everything in memory.
//!
//! Used for offline runs of the wizard and as the test double for the
//! controller. Crawl status text is scripted: each poll pops the next entry,
//! and the last entry repeats once the script runs out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use super::OnboardingApi;
use super::model::{
    Branding, BrandingUpdate, DataSourceRecord, NewDataSource, NewProject, OnboardingStatus,
    ProjectRecord, TestAnswer, TestQuery,
};
use crate::error::ApiError;

/// Backend operations, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    OnboardingStatus,
    SaveBranding,
    GetBranding,
    CreateProject,
    CreateDataSource,
    StartCrawl,
    CrawlStatus,
    TestQuery,
    CompleteOnboarding,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OnboardingStatus => "onboarding status",
            Self::SaveBranding => "save branding",
            Self::GetBranding => "get branding",
            Self::CreateProject => "create project",
            Self::CreateDataSource => "create data source",
            Self::StartCrawl => "start crawl",
            Self::CrawlStatus => "crawl status",
            Self::TestQuery => "test query",
            Self::CompleteOnboarding => "complete onboarding",
        };
        write!(f, "{s}")
    }
}

/// Status text used when no script was supplied.
const DEFAULT_CRAWL_SCRIPT: [&str; 3] = ["queued", "crawling: 12 pages indexed", "crawl completed"];

#[derive(Default)]
struct Inner {
    status: OnboardingStatus,
    branding: Branding,
    projects: HashMap<String, ProjectRecord>,
    data_sources: HashMap<String, (String, NewDataSource)>,
    crawl_script: VecDeque<String>,
    last_crawl_status: Option<String>,
    calls: HashMap<Endpoint, usize>,
    failures: HashSet<Endpoint>,
    delays: HashMap<Endpoint, Duration>,
    status_override: Option<OnboardingStatus>,
    queries: Vec<TestQuery>,
}

/// Backend that lives entirely in memory.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                status: OnboardingStatus {
                    current_step: "branding".into(),
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    /// Replace the crawl status script.
    pub fn with_crawl_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().crawl_script = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Make the next call to `endpoint` fail with a 500.
    pub fn fail_next(&self, endpoint: Endpoint) {
        self.lock().failures.insert(endpoint);
    }

    /// Delay every call to `endpoint`.
    pub fn set_delay(&self, endpoint: Endpoint, delay: Duration) {
        self.lock().delays.insert(endpoint, delay);
    }

    /// Report this status instead of the tracked one, e.g. to simulate another
    /// session advancing the tenant.
    pub fn override_status(&self, status: OnboardingStatus) {
        self.lock().status_override = Some(status);
    }

    pub fn set_branding(&self, branding: Branding) {
        self.lock().branding = branding;
    }

    /// Number of calls made to `endpoint`.
    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.lock().calls.get(&endpoint).copied().unwrap_or(0)
    }

    pub fn project_count(&self) -> usize {
        self.lock().projects.len()
    }

    pub fn data_source_count(&self) -> usize {
        self.lock().data_sources.len()
    }

    pub fn test_queries(&self) -> Vec<TestQuery> {
        self.lock().queries.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call, apply any configured delay, and consume a queued
    /// failure.
    async fn enter(&self, endpoint: Endpoint) -> Result<(), ApiError> {
        let delay = {
            let mut inner = self.lock();
            *inner.calls.entry(endpoint).or_default() += 1;
            inner.delays.get(&endpoint).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.lock().failures.remove(&endpoint) {
            return Err(ApiError::Status {
                endpoint: endpoint.to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "injected failure".into(),
            });
        }
        Ok(())
    }
}

fn mark_completed(status: &mut OnboardingStatus, step: &str, next: &str) {
    if !status.completed_steps.iter().any(|s| s == step) {
        status.completed_steps.push(step.to_string());
    }
    status.current_step = next.to_string();
}

#[async_trait]
impl OnboardingApi for MemoryBackend {
    async fn onboarding_status(&self) -> Result<OnboardingStatus, ApiError> {
        self.enter(Endpoint::OnboardingStatus).await?;
        let inner = self.lock();
        Ok(inner
            .status_override
            .clone()
            .unwrap_or_else(|| inner.status.clone()))
    }

    async fn save_branding(&self, branding: &BrandingUpdate) -> Result<(), ApiError> {
        self.enter(Endpoint::SaveBranding).await?;
        let mut inner = self.lock();
        inner.branding = Branding::from(branding);
        mark_completed(&mut inner.status, "branding", "project");
        Ok(())
    }

    async fn get_branding(&self) -> Result<Branding, ApiError> {
        self.enter(Endpoint::GetBranding).await?;
        Ok(self.lock().branding.clone())
    }

    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, ApiError> {
        self.enter(Endpoint::CreateProject).await?;
        let record = ProjectRecord {
            id: format!("proj_{}", Uuid::new_v4().simple()),
            name: project.name.clone(),
            description: project.description.clone(),
        };
        let mut inner = self.lock();
        inner.projects.insert(record.id.clone(), record.clone());
        inner.status.project_id = Some(record.id.clone());
        mark_completed(&mut inner.status, "project", "data_source");
        Ok(record)
    }

    async fn create_data_source(
        &self,
        project_id: &str,
        source: &NewDataSource,
    ) -> Result<DataSourceRecord, ApiError> {
        self.enter(Endpoint::CreateDataSource).await?;
        let mut inner = self.lock();
        if !inner.projects.contains_key(project_id) {
            return Err(ApiError::NotFound {
                entity: "project".into(),
                id: project_id.to_string(),
            });
        }
        let id = format!("site_{}", Uuid::new_v4().simple());
        inner
            .data_sources
            .insert(id.clone(), (project_id.to_string(), source.clone()));
        Ok(DataSourceRecord {
            id,
            base_url: source.base_url.clone(),
        })
    }

    async fn start_crawl(&self, data_source_id: &str) -> Result<(), ApiError> {
        self.enter(Endpoint::StartCrawl).await?;
        let mut inner = self.lock();
        if !inner.data_sources.contains_key(data_source_id) {
            return Err(ApiError::NotFound {
                entity: "data source".into(),
                id: data_source_id.to_string(),
            });
        }
        if inner.crawl_script.is_empty() && inner.last_crawl_status.is_none() {
            inner.crawl_script = DEFAULT_CRAWL_SCRIPT.iter().map(|s| s.to_string()).collect();
        }
        Ok(())
    }

    async fn crawl_status(&self, data_source_id: &str) -> Result<String, ApiError> {
        self.enter(Endpoint::CrawlStatus).await?;
        let mut inner = self.lock();
        if !inner.data_sources.contains_key(data_source_id) {
            return Err(ApiError::NotFound {
                entity: "data source".into(),
                id: data_source_id.to_string(),
            });
        }
        let status = match inner.crawl_script.pop_front() {
            Some(next) => next,
            None => inner
                .last_crawl_status
                .clone()
                .unwrap_or_else(|| "queued".to_string()),
        };
        inner.last_crawl_status = Some(status.clone());
        Ok(status)
    }

    async fn test_query(&self, query: &TestQuery) -> Result<TestAnswer, ApiError> {
        self.enter(Endpoint::TestQuery).await?;
        let mut inner = self.lock();
        let Some(project) = inner.projects.get(&query.project_id).cloned() else {
            return Err(ApiError::NotFound {
                entity: "project".into(),
                id: query.project_id.clone(),
            });
        };
        inner.queries.push(query.clone());
        let sources: Vec<serde_json::Value> = inner
            .data_sources
            .values()
            .filter(|(pid, _)| *pid == project.id)
            .map(|(_, ds)| serde_json::json!({ "url": ds.base_url }))
            .collect();
        Ok(TestAnswer {
            answer: format!(
                "{} answered {:?} from {} source(s).",
                project.name,
                query.query,
                sources.len()
            ),
            sources,
        })
    }

    async fn complete_onboarding(&self) -> Result<(), ApiError> {
        self.enter(Endpoint::CompleteOnboarding).await?;
        let mut inner = self.lock();
        mark_completed(&mut inner.status, "data_source", "test");
        mark_completed(&mut inner.status, "test", "test");
        Ok(())
    }
}
