//! Webhook lifecycle per project: check, create, update and delete through
//! the fan-out engine, with row state kept in original project order.
//!
//! Row transitions:
//!
//! ```text
//! Inactive --toggle--> Loading --create ok--> Active
//! Active   --toggle--> Loading --delete ok--> Inactive
//! any failure -> Errored   (left only through refresh)
//! ```
//!
//! `Loading` and `Errored` rows ignore toggles, so one project never has two
//! mutations in flight. Toggles and refreshes share the mutation lock; reset
//! takes it exclusively, so the identity never rotates under a request built
//! from the old one.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::engine::{self, Fetcher, RefreshSlot, RunError, RunResult};
use crate::model::{
    FetchFailure, Outcome, Project, Registration, ViewState, WebhookItem, WebhookState,
};
use crate::reconcile;
use crate::revenuecat::{ApiError, RevenueCatApi, WebhookRequest};
use crate::store::ProjectStore;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown project {0}")]
    UnknownProject(String),
    #[error("project {0} has no active webhook")]
    NotActive(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// How the registered webhook is named and where it points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookSettings {
    pub endpoint: String,
    pub device_name: String,
    pub environment: String,
}

impl WebhookSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            endpoint: cfg.app.webhook_endpoint.clone(),
            device_name: cfg.app.device_name.clone(),
            environment: cfg.app.environment.clone(),
        }
    }

    pub fn url_for(&self, identity: &str) -> String {
        format!("{}?id={}", self.endpoint, identity)
    }

    pub fn request_for(&self, identity: &str) -> WebhookRequest {
        WebhookRequest {
            name: format!("Kedi / {} / {}", self.device_name, identity),
            url: self.url_for(identity),
            environment: self.environment.clone(),
        }
    }
}

/// Remote operation one lifecycle run performs per project.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Find the webhook whose URL matches ours.
    Check { url: String },
    Create { request: WebhookRequest },
    /// Re-point the project's current webhook.
    Update { request: WebhookRequest },
    /// Remove the project's current webhook.
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Check { .. } => "check",
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete => "delete",
        }
    }
}

/// Update and delete act on `project.webhook_id`; a project without one
/// resolves to [`Outcome::Empty`].
pub struct LifecycleFetcher {
    api: Arc<dyn RevenueCatApi>,
    operation: Operation,
}

impl LifecycleFetcher {
    pub fn new(api: Arc<dyn RevenueCatApi>, operation: Operation) -> Self {
        Self { api, operation }
    }
}

#[async_trait]
impl Fetcher for LifecycleFetcher {
    type Output = Registration;

    async fn fetch(&self, project: &Project) -> Outcome<Registration> {
        let result = match &self.operation {
            Operation::Check { url } => self
                .api
                .list_webhooks(&project.id)
                .await
                .map(|hooks| {
                    hooks
                        .into_iter()
                        .find(|hook| hook.url.as_deref() == Some(url.as_str()))
                        .and_then(|hook| hook.id)
                        .map_or(Registration::Inactive, Registration::Active)
                }),
            Operation::Create { request } => self
                .api
                .create_webhook(&project.id, request)
                .await
                .and_then(|hook| hook.id.map(Registration::Active).ok_or(ApiError::Missing("webhook id"))),
            Operation::Update { request } => {
                let Some(webhook_id) = project.webhook_id.as_deref() else {
                    return Outcome::Empty;
                };
                self.api
                    .update_webhook(&project.id, webhook_id, request)
                    .await
                    .map(|_| Registration::Active(webhook_id.to_string()))
            }
            Operation::Delete => {
                let Some(webhook_id) = project.webhook_id.as_deref() else {
                    return Outcome::Empty;
                };
                self.api
                    .delete_webhook(&project.id, webhook_id)
                    .await
                    .map(|()| Registration::Inactive)
            }
        };
        if let Err(err) = &result {
            warn!(project_id = %project.id, operation = self.operation.as_str(), %err, "webhook operation failed");
        }
        result.into()
    }
}

/// Whether rows missing from the run result are dropped or kept as they were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Every row was submitted; a missing entry drops the row.
    Full,
    /// Only some rows were submitted; the rest keep their state.
    Partial,
}

/// Apply a run's outcomes onto `previous`, keeping its order.
pub fn merge(
    previous: &[WebhookItem],
    outcomes: &RunResult<Registration>,
    mode: MergeMode,
) -> Vec<WebhookItem> {
    previous
        .iter()
        .filter_map(|item| match outcomes.get(&item.project.id) {
            Some(outcome) => Some(WebhookItem {
                project: item.project.clone(),
                state: state_from(outcome),
            }),
            None => match mode {
                MergeMode::Full => None,
                MergeMode::Partial => Some(item.clone()),
            },
        })
        .collect()
}

fn state_from(outcome: &Outcome<Registration>) -> WebhookState {
    match outcome {
        Outcome::Success(Registration::Active(id)) => WebhookState::Active(id.clone()),
        Outcome::Success(Registration::Inactive) | Outcome::Empty => WebhookState::Inactive,
        Outcome::Failure(err) => WebhookState::Errored(err.clone()),
    }
}

/// Rows whose project took part in the run.
fn touched(items: &[WebhookItem], outcomes: &RunResult<Registration>) -> Vec<WebhookItem> {
    items
        .iter()
        .filter(|item| outcomes.contains_key(&item.project.id))
        .cloned()
        .collect()
}

/// Rows and coarse state as shown before a refresh began.
type Shown = (Vec<WebhookItem>, ViewState);

/// Presentation surface for the webhook settings screen.
///
/// Lock order: `mutations`, then `inflight`, then `items`.
pub struct WebhookManager {
    store: ProjectStore,
    api: Arc<dyn RevenueCatApi>,
    settings: WebhookSettings,
    items: Mutex<Vec<WebhookItem>>,
    state_tx: watch::Sender<ViewState>,
    inflight: Mutex<RefreshSlot<Shown>>,
    mutations: RwLock<()>,
}

impl WebhookManager {
    /// Seeds one `Loading` row per project in the store. Call
    /// [`Self::refresh`] to resolve them.
    pub async fn new(
        store: ProjectStore,
        api: Arc<dyn RevenueCatApi>,
        settings: WebhookSettings,
    ) -> Self {
        let items = store
            .snapshot()
            .await
            .into_iter()
            .map(WebhookItem::loading)
            .collect();
        let (state_tx, _) = watch::channel(ViewState::Loading);
        Self {
            store,
            api,
            settings,
            items: Mutex::new(items),
            state_tx,
            inflight: Mutex::new(RefreshSlot::default()),
            mutations: RwLock::new(()),
        }
    }

    pub async fn current_states(&self) -> Vec<WebhookItem> {
        self.items.lock().await.clone()
    }

    pub async fn state_of(&self, project_id: &str) -> Option<WebhookState> {
        self.items
            .lock()
            .await
            .iter()
            .find(|item| item.project.id == project_id)
            .map(|item| item.state.clone())
    }

    pub fn state(&self) -> ViewState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state_tx.subscribe()
    }

    pub async fn identity(&self) -> String {
        self.store.identity().await
    }

    /// Abandon the in-flight refresh, if any.
    pub async fn cancel(&self) {
        self.inflight.lock().await.cancel();
    }

    /// Reset every row to `Loading` from a fresh snapshot, check each
    /// project's registration, and commit the resolved associations. An
    /// explicit [`Self::cancel`] puts back the rows shown before the refresh;
    /// a superseded refresh leaves the surface to its successor.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<ViewState, RunError> {
        let _shared = self.mutations.read().await;
        let projects = self.store.snapshot().await;
        let seeded: Vec<WebhookItem> = projects.iter().cloned().map(WebhookItem::loading).collect();
        let (generation, token) = {
            let mut slot = self.inflight.lock().await;
            let mut items = self.items.lock().await;
            let previous = std::mem::replace(&mut *items, seeded.clone());
            let started = slot.begin((previous, self.state()));
            self.state_tx.send_replace(ViewState::Loading);
            started
        };

        let identity = self.store.identity().await;
        let fetcher = Arc::new(LifecycleFetcher::new(
            self.api.clone(),
            Operation::Check {
                url: self.settings.url_for(&identity),
            },
        ));
        let outcomes = match engine::run(&projects, fetcher, &token).await {
            Ok(outcomes) => outcomes,
            Err(RunError::Cancelled) => {
                let mut slot = self.inflight.lock().await;
                self.abandon(&mut slot, &mut *self.items.lock().await, generation);
                return Err(RunError::Cancelled);
            }
            Err(err) => {
                warn!(%err, "webhook run failed");
                self.inflight.lock().await.finish(generation);
                self.state_tx.send_replace(ViewState::Error);
                return Err(err);
            }
        };

        let mut slot = self.inflight.lock().await;
        let mut items = self.items.lock().await;
        if token.is_cancelled() {
            self.abandon(&mut slot, &mut items, generation);
            return Err(RunError::Cancelled);
        }
        let next = merge(&seeded, &outcomes, MergeMode::Full);
        reconcile::commit(&self.store, &touched(&next, &outcomes)).await;
        let state = if next.is_empty() {
            ViewState::Empty
        } else {
            ViewState::Data
        };
        *items = next;
        slot.finish(generation);
        self.state_tx.send_replace(state);
        info!(rows = items.len(), state = state.as_str(), "webhooks refreshed");
        Ok(state)
    }

    /// Rows still `Loading` from the cancelled refresh go back to what they
    /// showed before it. Rows a mutation settled meanwhile stay as they are.
    fn abandon(
        &self,
        slot: &mut RefreshSlot<Shown>,
        items: &mut [WebhookItem],
        generation: u64,
    ) {
        let Some((previous, state)) = slot.abandon(generation) else {
            info!("webhook refresh superseded; dropping result");
            return;
        };
        for item in items.iter_mut() {
            if item.state != WebhookState::Loading {
                continue;
            }
            if let Some(before) = previous.iter().find(|p| p.project.id == item.project.id) {
                item.state = before.state.clone();
            }
        }
        info!(state = state.as_str(), "webhook refresh cancelled; previous rows restored");
        self.state_tx.send_replace(state);
    }

    /// Flip one project's registration. Returns the settled state, or `None`
    /// when the project is unknown or its row is `Loading`/`Errored`.
    #[instrument(skip(self))]
    pub async fn toggle(&self, project_id: &str) -> Option<WebhookState> {
        let _shared = self.mutations.read().await;
        let identity = self.store.identity().await;
        let (project, operation) = {
            let mut items = self.items.lock().await;
            let Some(item) = items.iter_mut().find(|item| item.project.id == project_id) else {
                debug!("toggle for unknown project ignored");
                return None;
            };
            let (project, operation) = match &item.state {
                WebhookState::Active(webhook_id) => (
                    item.project.clone().with_webhook(webhook_id.clone()),
                    Operation::Delete,
                ),
                WebhookState::Inactive => (
                    item.project.clone(),
                    Operation::Create {
                        request: self.settings.request_for(&identity),
                    },
                ),
                WebhookState::Loading | WebhookState::Errored(_) => {
                    debug!(state = item.state.as_str(), "toggle ignored");
                    return None;
                }
            };
            item.state = WebhookState::Loading;
            (project, operation)
        };

        info!(operation = operation.as_str(), "toggling webhook");
        let outcomes = self.run_mutation(vec![project], operation).await;
        let mut items = self.items.lock().await;
        let next = merge(&items, &outcomes, MergeMode::Partial);
        reconcile::commit(&self.store, &touched(&next, &outcomes)).await;
        *items = next;
        items
            .iter()
            .find(|item| item.project.id == project_id)
            .map(|item| item.state.clone())
    }

    /// Regenerate the caller identity and re-point every `Active` webhook at
    /// the new URL. Other rows are left alone. Waits for in-flight toggles
    /// and refreshes first. Returns how many rows were reset.
    #[instrument(skip_all)]
    pub async fn reset(&self) -> usize {
        let _exclusive = self.mutations.write().await;
        let identity = self.store.regenerate_identity().await;
        let targets: Vec<Project> = {
            let mut items = self.items.lock().await;
            items
                .iter_mut()
                .filter_map(|item| {
                    let WebhookState::Active(webhook_id) = &item.state else {
                        return None;
                    };
                    let project = item.project.clone().with_webhook(webhook_id.clone());
                    item.state = WebhookState::Loading;
                    Some(project)
                })
                .collect()
        };
        if targets.is_empty() {
            info!("no active webhooks to reset");
            return 0;
        }

        let count = targets.len();
        info!(count, "resetting webhooks");
        let operation = Operation::Update {
            request: self.settings.request_for(&identity),
        };
        let outcomes = self.run_mutation(targets, operation).await;
        let mut items = self.items.lock().await;
        let next = merge(&items, &outcomes, MergeMode::Partial);
        reconcile::commit(&self.store, &touched(&next, &outcomes)).await;
        *items = next;
        count
    }

    /// Ask the remote to deliver a test event to the project's webhook.
    /// Errors are returned to the caller rather than stored on the row.
    #[instrument(skip(self))]
    pub async fn send_test_notification(&self, project_id: &str) -> Result<(), WebhookError> {
        let webhook_id = match self.state_of(project_id).await {
            None => return Err(WebhookError::UnknownProject(project_id.to_string())),
            Some(WebhookState::Active(webhook_id)) => webhook_id,
            Some(_) => return Err(WebhookError::NotActive(project_id.to_string())),
        };
        self.api.test_webhook(project_id, &webhook_id).await?;
        info!("test notification sent");
        Ok(())
    }

    /// Mutations are not cancelled by refreshes; a run error marks every
    /// submitted row as errored.
    async fn run_mutation(
        &self,
        projects: Vec<Project>,
        operation: Operation,
    ) -> RunResult<Registration> {
        let fetcher = Arc::new(LifecycleFetcher::new(self.api.clone(), operation));
        match engine::run(&projects, fetcher, &CancellationToken::new()).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                warn!(%err, "webhook mutation run failed");
                projects
                    .into_iter()
                    .map(|p| (p.id, Outcome::Failure(FetchFailure::Interrupted(err.to_string()))))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WebhookSettings {
        WebhookSettings {
            endpoint: "https://api.kediapp.com/webhook".into(),
            device_name: "cli".into(),
            environment: "production".into(),
        }
    }

    #[test]
    fn request_embeds_identity() {
        let req = settings().request_for("abc");
        assert_eq!(req.url, "https://api.kediapp.com/webhook?id=abc");
        assert_eq!(req.name, "Kedi / cli / abc");
        assert_eq!(req.environment, "production");
    }

    #[test]
    fn full_merge_drops_rows_missing_from_result() {
        let previous = vec![
            WebhookItem::loading(Project::new("a")),
            WebhookItem::loading(Project::new("b")),
        ];
        let mut outcomes = RunResult::new();
        outcomes.insert("b".to_string(), Outcome::Success(Registration::Inactive));

        let full = merge(&previous, &outcomes, MergeMode::Full);
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].project.id, "b");

        let partial = merge(&previous, &outcomes, MergeMode::Partial);
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[0].state, WebhookState::Loading);
        assert_eq!(partial[1].state, WebhookState::Inactive);
    }

    #[test]
    fn empty_outcome_means_no_registration() {
        assert_eq!(state_from(&Outcome::Empty), WebhookState::Inactive);
    }
}
