//! Notification aggregation: latest webhook events from every project,
//! flattened into date sections, newest first.
//!
//! Per-project fetch failures are not surfaced here. A failing project simply
//! contributes no items, and the feed only reports `Empty` when nothing at all
//! came back.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::engine::{self, Fetcher, RefreshSlot, RunError, RunResult};
use crate::model::{NotificationItem, NotificationSection, Outcome, Project, ViewState};
use crate::revenuecat::{Event, RevenueCatApi};
use crate::store::ProjectStore;

/// Fetches the latest events for one project through its webhook.
pub struct NotificationFetcher {
    api: Arc<dyn RevenueCatApi>,
}

impl NotificationFetcher {
    pub fn new(api: Arc<dyn RevenueCatApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Fetcher for NotificationFetcher {
    type Output = Vec<NotificationItem>;

    async fn fetch(&self, project: &Project) -> Outcome<Vec<NotificationItem>> {
        let Some(webhook_id) = project.webhook_id.as_deref() else {
            return Outcome::Empty;
        };
        match self.api.latest_events(&project.id, webhook_id).await {
            Ok(events) => Outcome::Success(
                events
                    .into_iter()
                    .enumerate()
                    .map(|(index, event)| notification_from_event(project, index, event))
                    .collect(),
            ),
            Err(err) => {
                debug!(project_id = %project.id, %err, "notification fetch failed; skipping project");
                Outcome::Failure(err.into())
            }
        }
    }
}

fn notification_from_event(project: &Project, index: usize, event: Event) -> NotificationItem {
    NotificationItem {
        id: event
            .id
            .unwrap_or_else(|| format!("{}-{}", project.id, index)),
        project_id: project.id.clone(),
        project_name: project.display_name().to_string(),
        event_type: event.event_type,
        product_id: event.product_id,
        price: event.price,
        currency: event.currency,
        timestamp: event
            .event_timestamp_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis),
    }
}

/// Merge with calendar days taken in UTC.
pub fn merge(outcomes: RunResult<Vec<NotificationItem>>) -> Vec<NotificationSection> {
    merge_in(outcomes, &Utc)
}

/// Flatten successful payloads, drop untimestamped items, sort newest first
/// and group into one section per calendar day in `tz`.
///
/// Ties on timestamp are broken by project id then item id so the output does
/// not depend on the order units completed in.
pub fn merge_in<Tz: TimeZone>(
    outcomes: RunResult<Vec<NotificationItem>>,
    tz: &Tz,
) -> Vec<NotificationSection> {
    let mut items: Vec<(DateTime<Utc>, NotificationItem)> = outcomes
        .into_values()
        .filter_map(|outcome| match outcome {
            Outcome::Success(items) => Some(items),
            Outcome::Empty | Outcome::Failure(_) => None,
        })
        .flatten()
        .filter_map(|item| item.timestamp.map(|ts| (ts, item)))
        .collect();

    items.sort_by(|(ta, a), (tb, b)| {
        tb.cmp(ta)
            .then_with(|| a.project_id.cmp(&b.project_id))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut sections: Vec<NotificationSection> = Vec::new();
    for (ts, item) in items {
        let date = ts.with_timezone(tz).date_naive();
        match sections.last_mut() {
            Some(section) if section.date == date => section.notifications.push(item),
            _ => sections.push(NotificationSection {
                date,
                notifications: vec![item],
            }),
        }
    }
    sections
}

pub fn view_state(sections: &[NotificationSection]) -> ViewState {
    if sections.iter().all(|s| s.notifications.is_empty()) {
        ViewState::Empty
    } else {
        ViewState::Data
    }
}

/// Presentation surface for the notifications screen.
pub struct NotificationsFeed {
    store: ProjectStore,
    fetcher: Arc<NotificationFetcher>,
    offset: FixedOffset,
    sections: RwLock<Vec<NotificationSection>>,
    state_tx: watch::Sender<ViewState>,
    inflight: Mutex<RefreshSlot<ViewState>>,
}

impl NotificationsFeed {
    pub fn new(store: ProjectStore, api: Arc<dyn RevenueCatApi>, offset: FixedOffset) -> Self {
        let (state_tx, _) = watch::channel(ViewState::Loading);
        Self {
            store,
            fetcher: Arc::new(NotificationFetcher::new(api)),
            offset,
            sections: RwLock::new(Vec::new()),
            state_tx,
            inflight: Mutex::new(RefreshSlot::default()),
        }
    }

    pub async fn current_sections(&self) -> Vec<NotificationSection> {
        self.sections.read().await.clone()
    }

    pub fn state(&self) -> ViewState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state_tx.subscribe()
    }

    /// Abandon the in-flight refresh, if any.
    pub async fn cancel(&self) {
        self.inflight.lock().await.cancel();
    }

    /// Re-run the whole pipeline from a fresh store snapshot, publishing
    /// `Loading` until it settles. A superseded refresh returns
    /// [`RunError::Cancelled`] and publishes nothing; an explicitly cancelled
    /// one puts back the state shown before it started.
    #[instrument(skip_all)]
    pub async fn refresh(&self) -> Result<ViewState, RunError> {
        let (generation, token) = {
            let mut slot = self.inflight.lock().await;
            let started = slot.begin(self.state());
            self.state_tx.send_replace(ViewState::Loading);
            started
        };

        let projects = self.store.snapshot().await;
        let outcomes = match engine::run(&projects, self.fetcher.clone(), &token).await {
            Ok(outcomes) => outcomes,
            Err(RunError::Cancelled) => {
                self.abandon(&mut *self.inflight.lock().await, generation);
                return Err(RunError::Cancelled);
            }
            Err(err) => {
                warn!(%err, "notification run failed");
                self.inflight.lock().await.finish(generation);
                self.state_tx.send_replace(ViewState::Error);
                return Err(err);
            }
        };

        let sections = merge_in(outcomes, &self.offset);
        let state = view_state(&sections);

        let mut slot = self.inflight.lock().await;
        if token.is_cancelled() {
            self.abandon(&mut slot, generation);
            return Err(RunError::Cancelled);
        }
        let count: usize = sections.iter().map(|s| s.notifications.len()).sum();
        *self.sections.write().await = sections;
        slot.finish(generation);
        self.state_tx.send_replace(state);
        info!(notifications = count, state = state.as_str(), "notifications refreshed");
        Ok(state)
    }

    fn abandon(&self, slot: &mut RefreshSlot<ViewState>, generation: u64) {
        match slot.abandon(generation) {
            Some(previous) => {
                info!(state = previous.as_str(), "notification refresh cancelled");
                self.state_tx.send_replace(previous);
            }
            None => info!("notification refresh superseded; dropping result"),
        }
    }
}
