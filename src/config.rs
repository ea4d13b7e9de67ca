//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Timing knobs for the onboarding controller.
#[derive(Debug, Clone)]
pub struct WizardConfig {
    /// How often the crawl status endpoint is polled while a crawl runs.
    pub poll_interval: Duration,
    /// How long status sync stays suppressed after a user-driven step change.
    pub sync_hold: Duration,
    /// Upper bound on polling before the crawl is reported as stalled.
    pub crawl_timeout: Duration,
    /// Interval of the background status sync task.
    pub status_sync_interval: Duration,
    /// Where the user is sent once onboarding completes.
    pub redirect_to: String,
    /// Capacity of the wizard event broadcast channel.
    pub event_capacity: usize,
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            sync_hold: Duration::from_secs(2),
            crawl_timeout: Duration::from_secs(600), // 10 minutes
            status_sync_interval: Duration::from_secs(5),
            redirect_to: "/".to_string(),
            event_capacity: 64,
        }
    }
}

impl WizardConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset. Set-but-unparseable values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: env_duration(
                "SEARCH_ONBOARD_POLL_INTERVAL_SECS",
                Duration::from_secs,
                defaults.poll_interval,
            )?,
            sync_hold: env_duration(
                "SEARCH_ONBOARD_SYNC_HOLD_MS",
                Duration::from_millis,
                defaults.sync_hold,
            )?,
            crawl_timeout: env_duration(
                "SEARCH_ONBOARD_CRAWL_TIMEOUT_SECS",
                Duration::from_secs,
                defaults.crawl_timeout,
            )?,
            status_sync_interval: env_duration(
                "SEARCH_ONBOARD_STATUS_SYNC_SECS",
                Duration::from_secs,
                defaults.status_sync_interval,
            )?,
            ..defaults
        })
    }
}

/// Where and how to reach the backend.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Base URL, e.g. `https://dashboard.example.com`.
    pub base_url: String,
    /// Bearer token sent with every request, if any.
    pub api_key: Option<SecretString>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Build config from environment variables.
    /// Returns `None` if `SEARCH_ONBOARD_API_URL` is not set (offline mode).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Ok(base_url) = std::env::var("SEARCH_ONBOARD_API_URL") else {
            return Ok(None);
        };
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "SEARCH_ONBOARD_API_URL".into(),
                message: format!("expected an http(s) URL, got {base_url:?}"),
            });
        }

        let mut config = Self::new(base_url);
        if let Ok(key) = std::env::var("SEARCH_ONBOARD_API_KEY") {
            if !key.trim().is_empty() {
                config = config.with_api_key(key.trim());
            }
        }
        config.request_timeout = env_duration(
            "SEARCH_ONBOARD_REQUEST_TIMEOUT_SECS",
            Duration::from_secs,
            config.request_timeout,
        )?;
        Ok(Some(config))
    }
}

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub wizard: WizardConfig,
    /// `None` runs against the in-memory backend.
    pub api: Option<ApiConfig>,
}

impl Settings {
    pub fn from_env() -> crate::error::Result<Self> {
        let wizard = WizardConfig::from_env()?;
        let api = if offline_requested() {
            None
        } else {
            ApiConfig::from_env()?
        };
        Ok(Self { wizard, api })
    }
}

/// Whether the binary should run against the in-memory backend.
pub fn offline_requested() -> bool {
    std::env::var("SEARCH_ONBOARD_OFFLINE")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_duration(
    key: &str,
    unit: fn(u64) -> Duration,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse_duration(key, &raw, unit),
        Err(_) => Ok(default),
    }
}

fn parse_duration(key: &str, raw: &str, unit: fn(u64) -> Duration) -> Result<Duration, ConfigError> {
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected a non-negative integer, got {raw:?}"),
    })?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(unit(value))
}
