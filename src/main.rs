use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use kedi_sync::config;
use kedi_sync::model::WebhookItem;
use kedi_sync::notifications::NotificationsFeed;
use kedi_sync::revenuecat::{RevenueCatApi, RevenueCatClient};
use kedi_sync::webhooks::{WebhookManager, WebhookSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Fetch per-project notifications and manage webhooks")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print latest events from every project, grouped by day
    Notifications,
    /// Print webhook registration state for every project
    Webhooks,
    /// Register or unregister the webhook of one project
    Toggle { project_id: String },
    /// Regenerate the caller identity, re-point every active webhook and
    /// print the new identity
    Reset,
    /// Send a test event to one project's webhook
    Test { project_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let client = RevenueCatClient::from_config(&cfg).context("failed to build API client")?;
    let api: Arc<dyn RevenueCatApi> = Arc::new(client);
    let store = cfg.project_store();

    if !matches!(args.command, Command::Notifications) {
        cfg.require_identity()?;
    }

    match args.command {
        Command::Notifications => {
            let feed = NotificationsFeed::new(store, api, cfg.utc_offset());
            let state = feed.refresh().await?;
            info!(state = state.as_str(), "notifications loaded");
            print_json(&feed.current_sections().await)?;
        }
        Command::Webhooks => {
            let manager = WebhookManager::new(store, api, WebhookSettings::from_config(&cfg)).await;
            manager.refresh().await?;
            print_json(&manager.current_states().await)?;
        }
        Command::Toggle { project_id } => {
            let manager = WebhookManager::new(store, api, WebhookSettings::from_config(&cfg)).await;
            manager.refresh().await?;
            let Some(state) = manager.toggle(&project_id).await else {
                bail!("project {project_id} is unknown or not in a toggleable state");
            };
            print_json(&state)?;
        }
        Command::Reset => {
            let manager = WebhookManager::new(store, api, WebhookSettings::from_config(&cfg)).await;
            manager.refresh().await?;
            let count = manager.reset().await;
            let identity = manager.identity().await;
            warn!(%identity, "identity rotated; store it in the config before the next run");
            print_json(&ResetReport {
                identity,
                reset: count,
                webhooks: manager.current_states().await,
            })?;
        }
        Command::Test { project_id } => {
            let manager = WebhookManager::new(store, api, WebhookSettings::from_config(&cfg)).await;
            manager.refresh().await?;
            manager.send_test_notification(&project_id).await?;
            println!("test notification sent to {project_id}");
        }
    }

    Ok(())
}

/// Printed after `reset`; `identity` replaces the one in the config.
#[derive(Serialize)]
struct ResetReport {
    identity: String,
    reset: usize,
    webhooks: Vec<WebhookItem>,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
