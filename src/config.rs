//! Configuration loader and validator for the project sync engine.
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::Project;
use crate::store::ProjectStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub revenuecat: RevenueCat,
    /// Caller identity embedded in webhook URLs. Required by the webhook
    /// commands; generated per process when absent.
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub projects: Vec<Project>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub webhook_endpoint: String,
    pub device_name: String,
    pub environment: String,
    /// Offset used to bucket notifications into calendar days.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// Remote API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevenueCat {
    pub base_url: String,
    pub api_key: String,
}

const MAX_OFFSET_MINUTES: i32 = 18 * 60;

impl Config {
    /// Offset for calendar grouping; validated to be in range.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.app.utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix())
    }

    /// Build the shared store seeded with the configured projects.
    pub fn project_store(&self) -> ProjectStore {
        match &self.identity {
            Some(identity) => ProjectStore::with_identity(self.projects.clone(), identity.clone()),
            None => ProjectStore::new(self.projects.clone()),
        }
    }

    /// The configured identity. Webhooks are matched by the URL built from
    /// it, so a generated one never finds what an earlier run registered.
    pub fn require_identity(&self) -> Result<&str, ConfigError> {
        self.identity
            .as_deref()
            .ok_or(ConfigError::Invalid("identity must be set to manage webhooks"))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.webhook_endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("app.webhook_endpoint must be non-empty"));
    }
    if cfg.app.device_name.trim().is_empty() {
        return Err(ConfigError::Invalid("app.device_name must be non-empty"));
    }
    if cfg.app.environment.trim().is_empty() {
        return Err(ConfigError::Invalid("app.environment must be non-empty"));
    }
    if cfg.app.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
        return Err(ConfigError::Invalid(
            "app.utc_offset_minutes must be within +/-1080",
        ));
    }

    if cfg.revenuecat.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("revenuecat.base_url must be non-empty"));
    }
    if cfg.revenuecat.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("revenuecat.api_key must be non-empty"));
    }

    if let Some(identity) = &cfg.identity {
        if identity.trim().is_empty() {
            return Err(ConfigError::Invalid("identity must be non-empty when set"));
        }
    }

    let mut seen = HashSet::new();
    for project in &cfg.projects {
        if project.id.trim().is_empty() {
            return Err(ConfigError::Invalid("projects[].id must be non-empty"));
        }
        if !seen.insert(project.id.as_str()) {
            return Err(ConfigError::Invalid("projects[].id must be unique"));
        }
    }

    Ok(())
}

/// Returns the example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  webhook_endpoint: "https://api.kediapp.com/webhook"
  device_name: "kedi-sync"
  environment: "production"
  utc_offset_minutes: 0

revenuecat:
  base_url: "https://api.revenuecat.com/"
  api_key: "YOUR_REVENUECAT_TOKEN"

identity: "3f1c2a9e-5b7d-4e8a-9c61-2d4b8f0a7e15"

projects:
  - id: "proj1a2b3c"
    name: "My App"
    webhook_id: null
  - id: "proj4d5e6f"
    name: "Other App"
    webhook_id: "wh_123"
"#
}
