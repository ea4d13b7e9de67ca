//! Wire types exchanged with the dashboard backend.

use serde::{Deserialize, Serialize};

use crate::onboarding::model::CrawlCadence;

/// Where the tenant is in onboarding, as persisted by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingStatus {
    /// Step key: `branding`, `project`, `data_source` or `test`.
    pub current_step: String,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Branding as stored. Every field may be missing for a fresh tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_data_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
}

/// Body of a branding save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandingUpdate {
    pub org_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_data_url: Option<String>,
    pub primary_color: String,
}

impl From<&BrandingUpdate> for Branding {
    fn from(update: &BrandingUpdate) -> Self {
        Self {
            org_name: Some(update.org_name.clone()),
            logo_data_url: update.logo_data_url.clone(),
            primary_color: Some(update.primary_color.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDataSource {
    pub base_url: String,
    pub depth: u8,
    pub cadence: CrawlCadence,
    pub headless_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceRecord {
    pub id: String,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestQuery {
    pub project_id: String,
    pub query: String,
}

/// Answer to a test query. Sources are passed through as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestAnswer {
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
}
