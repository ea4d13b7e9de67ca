//! Cache invalidation hooks.
//!
//! The wizard never writes cached reads itself; after a mutating call it
//! tells whoever owns the cache which topic went stale.

use std::sync::Mutex;

use serde::Serialize;

/// Groups of cached reads that wizard actions can make stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTopic {
    OnboardingStatus,
    Branding,
    Projects,
    CrawlSites,
    Settings,
}

impl CacheTopic {
    pub const ALL: [CacheTopic; 5] = [
        CacheTopic::OnboardingStatus,
        CacheTopic::Branding,
        CacheTopic::Projects,
        CacheTopic::CrawlSites,
        CacheTopic::Settings,
    ];
}

impl std::fmt::Display for CacheTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OnboardingStatus => "onboarding_status",
            Self::Branding => "branding",
            Self::Projects => "projects",
            Self::CrawlSites => "crawl_sites",
            Self::Settings => "settings",
        };
        write!(f, "{s}")
    }
}

/// Something that can drop cached reads by topic.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, topic: CacheTopic);

    fn invalidate_all(&self) {
        for topic in CacheTopic::ALL {
            self.invalidate(topic);
        }
    }
}

/// Invalidator for callers with no cache: just logs.
#[derive(Debug, Default)]
pub struct LogInvalidator;

impl CacheInvalidator for LogInvalidator {
    fn invalidate(&self, topic: CacheTopic) {
        tracing::debug!(%topic, "Cache topic invalidated");
    }
}

/// Remembers every invalidation, in order.
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    topics: Mutex<Vec<CacheTopic>>,
}

impl RecordingInvalidator {
    pub fn topics(&self) -> Vec<CacheTopic> {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl CacheInvalidator for RecordingInvalidator {
    fn invalidate(&self, topic: CacheTopic) {
        self.topics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(topic);
    }
}
