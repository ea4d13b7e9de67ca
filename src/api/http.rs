//! reqwest client for the dashboard REST API.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;

use super::OnboardingApi;
use super::model::{
    Branding, BrandingUpdate, DataSourceRecord, NewDataSource, NewProject, OnboardingStatus,
    ProjectRecord, TestAnswer, TestQuery,
};
use crate::config::ApiConfig;
use crate::error::ApiError;

/// Dashboard backend over HTTP.
pub struct HttpBackend {
    config: ApiConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Request {
                endpoint: config.base_url.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self
            .client
            .request(method, format!("{}{path}", self.config.base_url));
        match self.config.api_key {
            Some(ref key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    /// Send a request and turn non-2xx responses into errors.
    async fn send(&self, endpoint: &str, req: RequestBuilder) -> Result<Response, ApiError> {
        let resp = req.send().await.map_err(|e| ApiError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(endpoint, %status, body = %body, "Backend returned an error");
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                entity: endpoint.to_string(),
                id: body,
            });
        }
        Err(ApiError::Status {
            endpoint: endpoint.to_string(),
            status,
            body,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        req: RequestBuilder,
    ) -> Result<T, ApiError> {
        let resp = self.send(endpoint, req).await?;
        let text = resp.text().await.map_err(|e| ApiError::Request {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse {
            endpoint: endpoint.to_string(),
            reason: format!("{e} (body: {})", truncate(&text, 200)),
        })
    }
}

#[async_trait]
impl OnboardingApi for HttpBackend {
    async fn onboarding_status(&self) -> Result<OnboardingStatus, ApiError> {
        self.send_json(
            "onboarding status",
            self.request(Method::GET, "/api/onboarding/status"),
        )
        .await
    }

    async fn save_branding(&self, branding: &BrandingUpdate) -> Result<(), ApiError> {
        self.send(
            "save branding",
            self.request(Method::PUT, "/api/branding").json(branding),
        )
        .await?;
        Ok(())
    }

    async fn get_branding(&self) -> Result<Branding, ApiError> {
        self.send_json("get branding", self.request(Method::GET, "/api/branding"))
            .await
    }

    async fn create_project(&self, project: &NewProject) -> Result<ProjectRecord, ApiError> {
        self.send_json(
            "create project",
            self.request(Method::POST, "/api/projects").json(project),
        )
        .await
    }

    async fn create_data_source(
        &self,
        project_id: &str,
        source: &NewDataSource,
    ) -> Result<DataSourceRecord, ApiError> {
        self.send_json(
            "create data source",
            self.request(Method::POST, &format!("/api/projects/{project_id}/crawl-sites"))
                .json(source),
        )
        .await
    }

    async fn start_crawl(&self, data_source_id: &str) -> Result<(), ApiError> {
        self.send(
            "start crawl",
            self.request(Method::POST, &format!("/api/crawl-sites/{data_source_id}/crawl")),
        )
        .await?;
        Ok(())
    }

    async fn crawl_status(&self, data_source_id: &str) -> Result<String, ApiError> {
        let resp = self
            .send(
                "crawl status",
                self.request(
                    Method::GET,
                    &format!("/api/crawl-sites/{data_source_id}/status"),
                ),
            )
            .await?;
        let body = resp.text().await.map_err(|e| ApiError::Request {
            endpoint: "crawl status".into(),
            reason: e.to_string(),
        })?;
        Ok(extract_status_text(&body))
    }

    async fn test_query(&self, query: &TestQuery) -> Result<TestAnswer, ApiError> {
        self.send_json(
            "test query",
            self.request(Method::POST, "/api/search/test").json(query),
        )
        .await
    }

    async fn complete_onboarding(&self) -> Result<(), ApiError> {
        self.send(
            "complete onboarding",
            self.request(Method::POST, "/api/onboarding/complete"),
        )
        .await?;
        Ok(())
    }
}

/// Pull the status text out of a crawl-status body.
///
/// Accepts `{"status": "..."}`, a bare JSON string, or plain text.
pub fn extract_status_text(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(serde_json::Value::Object(map)) => map
            .get("status")
            .or_else(|| map.get("message"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| body.trim().to_string()),
        _ => body.trim().to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
