use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tracked project. The webhook association is the only field the engine
/// ever proposes to change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub webhook_id: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            webhook_id: None,
        }
    }

    pub fn with_webhook(mut self, webhook_id: impl Into<String>) -> Self {
        self.webhook_id = Some(webhook_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name shown next to notification rows; falls back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Failure of one entity's fetch. Cloneable so it can live inside row state.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("run interrupted: {0}")]
    Interrupted(String),
}

/// Result of processing one entity in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    /// The entity had nothing to query. Not an error.
    Empty,
    Failure(FetchFailure),
}

impl<T> Outcome<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Empty => "empty",
            Outcome::Failure(_) => "failure",
        }
    }
}

impl<T, E: Into<FetchFailure>> From<Result<T, E>> for Outcome<T> {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(v) => Outcome::Success(v),
            Err(err) => Outcome::Failure(err.into()),
        }
    }
}

/// What a webhook fetch unit resolved to on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Active(String),
    Inactive,
}

/// Per-project webhook row state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum WebhookState {
    Loading,
    Active(String),
    Inactive,
    Errored(FetchFailure),
}

impl WebhookState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookState::Loading => "loading",
            WebhookState::Active(_) => "active",
            WebhookState::Inactive => "inactive",
            WebhookState::Errored(_) => "errored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookItem {
    pub project: Project,
    pub state: WebhookState,
}

impl WebhookItem {
    pub fn loading(project: Project) -> Self {
        Self {
            project,
            state: WebhookState::Loading,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationItem {
    pub id: String,
    pub project_id: String,
    pub project_name: String,
    pub event_type: Option<String>,
    pub product_id: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Notifications sharing one calendar date, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationSection {
    pub date: NaiveDate,
    pub notifications: Vec<NotificationItem>,
}

/// Coarse state consumed by the rendering layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViewState {
    Loading,
    Empty,
    Data,
    Error,
}

impl ViewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViewState::Loading => "loading",
            ViewState::Empty => "empty",
            ViewState::Data => "data",
            ViewState::Error => "error",
        }
    }
}
