use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::FetchFailure;

const REVENUECAT_API_BASE: &str = "https://api.revenuecat.com/";
const PROJECTS_PATH: &str = "internal/v1/developers/me/projects";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to reach RevenueCat: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("RevenueCat returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid RevenueCat response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("RevenueCat response missing {0}")]
    Missing(&'static str),
    #[error("invalid RevenueCat URL: {0}")]
    InvalidUrl(String),
}

impl From<ApiError> for FetchFailure {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Transport(e) => FetchFailure::Transport(e.to_string()),
            ApiError::Status { status, body } => FetchFailure::Status {
                status: status.as_u16(),
                body,
            },
            ApiError::Decode(e) => FetchFailure::Decode(e.to_string()),
            ApiError::Missing(field) => FetchFailure::Decode(format!("missing {field}")),
            ApiError::InvalidUrl(url) => FetchFailure::Transport(format!("invalid url {url}")),
        }
    }
}

/// A webhook integration registered on a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    pub id: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub environment: Option<String>,
}

/// Body for create and update calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookRequest {
    pub name: String,
    pub url: String,
    pub environment: String,
}

/// One event as delivered to a webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub product_id: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub event_timestamp_ms: Option<i64>,
}

#[derive(Deserialize)]
struct LatestEventsResponse {
    events: Option<Vec<Event>>,
}

/// Remote operations the engine's fetchers are built on.
#[async_trait]
pub trait RevenueCatApi: Send + Sync + 'static {
    async fn list_webhooks(&self, project_id: &str) -> Result<Vec<Webhook>, ApiError>;

    async fn create_webhook(
        &self,
        project_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError>;

    async fn update_webhook(
        &self,
        project_id: &str,
        webhook_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError>;

    async fn delete_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError>;

    async fn test_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError>;

    async fn latest_events(&self, project_id: &str, webhook_id: &str)
        -> Result<Vec<Event>, ApiError>;
}

#[derive(Clone)]
pub struct RevenueCatClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for RevenueCatClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevenueCatClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RevenueCatClient {
    pub fn new(api_key: String) -> Result<Self, ApiError> {
        let base_url = parse_base_url(REVENUECAT_API_BASE)?;
        Self::with_base_url(api_key, base_url)
    }

    pub fn with_base_url(api_key: String, base_url: Url) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("kedi-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ApiError> {
        let base_url = parse_base_url(&cfg.revenuecat.base_url)?;
        Self::with_base_url(cfg.revenuecat.api_key.clone(), base_url)
    }

    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Request, ApiError> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|e| ApiError::InvalidUrl(format!("{path}: {e}")))?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }

    async fn send(&self, request: reqwest::Request) -> Result<String, ApiError> {
        debug!(method = %request.method(), url = %request.url(), "revenuecat request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        if !status.is_success() {
            warn!(%status, "revenuecat request failed");
            return Err(ApiError::Status { status, body });
        }
        debug!(%status, bytes = body.len(), "revenuecat response");
        Ok(body)
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T, ApiError> {
        let body = self.send(request).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    Url::parse(raw).map_err(|e| ApiError::InvalidUrl(format!("{raw}: {e}")))
}

fn webhooks_path(project_id: &str) -> String {
    format!("{PROJECTS_PATH}/{project_id}/integrations/webhooks")
}

fn webhook_path(project_id: &str, webhook_id: &str) -> String {
    format!("{}/{webhook_id}", webhooks_path(project_id))
}

#[async_trait]
impl RevenueCatApi for RevenueCatClient {
    async fn list_webhooks(&self, project_id: &str) -> Result<Vec<Webhook>, ApiError> {
        let request = self.build_request::<()>(Method::GET, &webhooks_path(project_id), None)?;
        self.execute(request).await
    }

    async fn create_webhook(
        &self,
        project_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError> {
        let request = self.build_request(Method::POST, &webhooks_path(project_id), Some(request))?;
        let webhook: Webhook = self.execute(request).await?;
        if webhook.id.as_deref().map_or(true, str::is_empty) {
            return Err(ApiError::Missing("webhook id"));
        }
        Ok(webhook)
    }

    async fn update_webhook(
        &self,
        project_id: &str,
        webhook_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError> {
        let request = self.build_request(
            Method::PUT,
            &webhook_path(project_id, webhook_id),
            Some(request),
        )?;
        self.execute(request).await
    }

    async fn delete_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError> {
        let request =
            self.build_request::<()>(Method::DELETE, &webhook_path(project_id, webhook_id), None)?;
        self.send(request).await.map(|_| ())
    }

    async fn test_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError> {
        let path = format!("{}/test", webhook_path(project_id, webhook_id));
        let request = self.build_request::<()>(Method::POST, &path, None)?;
        self.send(request).await.map(|_| ())
    }

    async fn latest_events(
        &self,
        project_id: &str,
        webhook_id: &str,
    ) -> Result<Vec<Event>, ApiError> {
        let path = format!("{}/events", webhook_path(project_id, webhook_id));
        let request = self.build_request::<()>(Method::GET, &path, None)?;
        let payload: LatestEventsResponse = self.execute(request).await?;
        Ok(payload.events.unwrap_or_default())
    }
}
