//! Form data collected by the wizard and its local validation.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::api::model::{Branding, BrandingUpdate, NewDataSource, NewProject};
use crate::error::WizardError;

/// Primary color used until the user picks one.
pub const DEFAULT_PRIMARY_COLOR: &str = "#2563eb";

static HEX_COLOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#(?:[0-9a-fA-F]{3}|[0-9a-fA-F]{6})$").unwrap());

/// Organization branding, edited on step 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_data_uri: Option<String>,
    pub primary_color: String,
}

impl Default for Organization {
    fn default() -> Self {
        Self {
            name: String::new(),
            logo_data_uri: None,
            primary_color: DEFAULT_PRIMARY_COLOR.to_string(),
        }
    }
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), WizardError> {
        if self.name.trim().is_empty() {
            return Err(WizardError::validation("organization name", "is required"));
        }
        if !HEX_COLOR.is_match(self.primary_color.trim()) {
            return Err(WizardError::validation(
                "primary color",
                format!("must be a hex color like #2563eb, got {:?}", self.primary_color),
            ));
        }
        if let Some(ref logo) = self.logo_data_uri {
            if !logo.starts_with("data:image/") {
                return Err(WizardError::validation(
                    "logo",
                    "must be an image data URI (data:image/...)",
                ));
            }
        }
        Ok(())
    }

    pub fn to_update(&self) -> BrandingUpdate {
        BrandingUpdate {
            org_name: self.name.trim().to_string(),
            logo_data_url: self.logo_data_uri.clone(),
            primary_color: self.primary_color.trim().to_string(),
        }
    }

    /// Fill fields from stored branding. Fields the service does not report
    /// keep their current value.
    pub fn merge_from(&mut self, branding: &Branding) {
        if let Some(ref name) = branding.org_name {
            self.name = name.clone();
        }
        if branding.logo_data_url.is_some() {
            self.logo_data_uri = branding.logo_data_url.clone();
        }
        if let Some(ref color) = branding.primary_color {
            self.primary_color = color.clone();
        }
    }

    /// Compare what was saved against what the branding service returns.
    /// Returns the first field that differs.
    pub fn verify_saved(update: &BrandingUpdate, stored: &Branding) -> Result<(), WizardError> {
        if stored.org_name.as_deref() != Some(update.org_name.as_str()) {
            return Err(WizardError::ReadAfterWrite { field: "org_name" });
        }
        if stored.logo_data_url != update.logo_data_url {
            return Err(WizardError::ReadAfterWrite {
                field: "logo_data_url",
            });
        }
        let stored_color = stored.primary_color.as_deref().unwrap_or_default();
        if !stored_color.eq_ignore_ascii_case(&update.primary_color) {
            return Err(WizardError::ReadAfterWrite {
                field: "primary_color",
            });
        }
        Ok(())
    }
}

/// Project being created on step 2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectDraft {
    /// Set once by project creation, never changed afterward.
    pub id: Option<String>,
    pub name: String,
    pub description: String,
}

impl ProjectDraft {
    pub fn validate(&self) -> Result<(), WizardError> {
        if self.name.trim().is_empty() {
            return Err(WizardError::validation("project name", "is required"));
        }
        if self.description.trim().is_empty() {
            return Err(WizardError::validation("project description", "is required"));
        }
        Ok(())
    }

    pub fn to_new(&self) -> NewProject {
        NewProject {
            name: self.name.trim().to_string(),
            description: self.description.trim().to_string(),
        }
    }
}

/// How often the crawl re-runs after the first pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlCadence {
    Hourly,
    Daily,
    Weekly,
}

impl Default for CrawlCadence {
    fn default() -> Self {
        Self::Daily
    }
}

impl std::fmt::Display for CrawlCadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
        }
    }
}

impl std::str::FromStr for CrawlCadence {
    type Err = WizardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(WizardError::validation(
                "cadence",
                format!("must be hourly, daily or weekly, got {other:?}"),
            )),
        }
    }
}

/// Link depth followed by the crawler, 1 through 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct CrawlDepth(u8);

impl CrawlDepth {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for CrawlDepth {
    fn default() -> Self {
        Self(2)
    }
}

impl TryFrom<u8> for CrawlDepth {
    type Error = WizardError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(WizardError::validation(
                "crawl depth",
                format!("must be between {} and {}, got {value}", Self::MIN, Self::MAX),
            ))
        }
    }
}

impl From<CrawlDepth> for u8 {
    fn from(depth: CrawlDepth) -> Self {
        depth.0
    }
}

/// User-editable crawl settings for step 3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceForm {
    pub source_url: String,
    pub crawl_depth: CrawlDepth,
    pub cadence: CrawlCadence,
    pub headless_mode: bool,
}

impl DataSourceForm {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            ..Default::default()
        }
    }
}

/// Data source for step 3, plus the id once it exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceDraft {
    /// Set once by data-source creation and reused by every later crawl start.
    pub id: Option<String>,
    pub source_url: String,
    pub crawl_depth: CrawlDepth,
    pub cadence: CrawlCadence,
    pub headless_mode: bool,
}

impl DataSourceDraft {
    /// Whether `form` carries the settings this draft already has.
    pub fn matches(&self, form: &DataSourceForm) -> bool {
        self.source_url.trim() == form.source_url.trim()
            && self.crawl_depth == form.crawl_depth
            && self.cadence == form.cadence
            && self.headless_mode == form.headless_mode
    }

    pub fn apply(&mut self, form: DataSourceForm) {
        self.source_url = form.source_url;
        self.crawl_depth = form.crawl_depth;
        self.cadence = form.cadence;
        self.headless_mode = form.headless_mode;
    }

    pub fn validate(&self) -> Result<(), WizardError> {
        let url = self.source_url.trim();
        if url.is_empty() {
            return Err(WizardError::validation("source URL", "is required"));
        }
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| WizardError::validation("source URL", "must start with http:// or https://"))?;
        let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(WizardError::validation("source URL", "must include a host"));
        }
        Ok(())
    }

    pub fn to_new(&self) -> NewDataSource {
        NewDataSource {
            base_url: self.source_url.trim().to_string(),
            depth: self.crawl_depth.get(),
            cadence: self.cadence,
            headless_mode: self.headless_mode,
        }
    }
}
