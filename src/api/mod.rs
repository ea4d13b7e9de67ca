//! Backend services the wizard talks to.
//!
//! Everything goes through the [`OnboardingApi`] trait so the controller can
//! run against the real dashboard backend ([`HttpBackend`]) or an in-process
//! stand-in ([`MemoryBackend`]).

pub mod http;
pub mod memory;
pub mod model;

pub use http::HttpBackend;
pub use memory::{Endpoint, MemoryBackend};
pub use model::{
    Branding, BrandingUpdate, DataSourceRecord, NewDataSource, NewProject, OnboardingStatus,
    ProjectRecord, TestAnswer, TestQuery,
};

use async_trait::async_trait;

use crate::error::ApiError;

/// Operations consumed by the onboarding wizard.
#[async_trait]
pub trait OnboardingApi: Send + Sync {
    /// Which step the tenant last reached and which steps are done.
    async fn onboarding_status(&self) -> Result<OnboardingStatus, ApiError>;

    async fn save_branding(&self, branding: &BrandingUpdate) -> Result<(), ApiError>;

    async fn get_branding(&self) -> Result<Branding, ApiError>;

    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, ApiError>;

    async fn create_data_source(
        &self,
        project_id: &str,
        source: &NewDataSource,
    ) -> Result<DataSourceRecord, ApiError>;

    /// Kick off a crawl. Completion is only observable through
    /// [`crawl_status`](Self::crawl_status).
    async fn start_crawl(&self, data_source_id: &str) -> Result<(), ApiError>;

    /// Free-text crawl status.
    async fn crawl_status(&self, data_source_id: &str) -> Result<String, ApiError>;

    async fn test_query(&self, query: &TestQuery) -> Result<TestAnswer, ApiError>;

    async fn complete_onboarding(&self) -> Result<(), ApiError>;
}
