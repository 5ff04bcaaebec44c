#![allow(dead_code)]

use async_trait::async_trait;
use kedi_sync::revenuecat::{ApiError, Event, RevenueCatApi, Webhook, WebhookRequest};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    List(String),
    Create(String, WebhookRequest),
    Update(String, String, WebhookRequest),
    Delete(String, String),
    Test(String, String),
    Events(String, String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Call::Create(..) | Call::Update(..) | Call::Delete(..))
    }
}

/// In-memory stand-in for the remote API. Every call is recorded; projects
/// can be made to fail, to respond slowly, or to block until released.
#[derive(Clone, Default)]
pub struct FakeRevenueCat {
    webhooks: Arc<Mutex<HashMap<String, Vec<Webhook>>>>,
    events: Arc<Mutex<HashMap<String, Vec<Event>>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    delays: Arc<Mutex<HashMap<String, Duration>>>,
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    calls: Arc<Mutex<Vec<Call>>>,
    next_id: Arc<AtomicUsize>,
}

pub fn server_error() -> ApiError {
    ApiError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: "boom".into(),
    }
}

pub fn event(id: &str, ts_ms: Option<i64>) -> Event {
    Event {
        id: Some(id.into()),
        event_type: Some("RENEWAL".into()),
        product_id: Some("pro_monthly".into()),
        price: Some(9.99),
        currency: Some("USD".into()),
        event_timestamp_ms: ts_ms,
    }
}

impl FakeRevenueCat {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_webhook(&self, project_id: &str, webhook_id: &str, url: &str) {
        self.webhooks
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .push(Webhook {
                id: Some(webhook_id.into()),
                name: Some("existing".into()),
                url: Some(url.into()),
                environment: Some("production".into()),
            });
    }

    pub async fn webhooks_of(&self, project_id: &str) -> Vec<Webhook> {
        self.webhooks
            .lock()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_events(&self, project_id: &str, events: Vec<Event>) {
        self.events
            .lock()
            .await
            .insert(project_id.to_string(), events);
    }

    pub async fn fail(&self, project_id: &str) {
        self.failing.lock().await.insert(project_id.to_string());
    }

    pub async fn recover(&self, project_id: &str) {
        self.failing.lock().await.remove(project_id);
    }

    pub async fn delay(&self, project_id: &str, delay: Duration) {
        self.delays
            .lock()
            .await
            .insert(project_id.to_string(), delay);
    }

    /// Hold every call for `project_id` until [`Self::release`].
    pub async fn block(&self, project_id: &str) {
        self.gates
            .lock()
            .await
            .insert(project_id.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub async fn release(&self, project_id: &str) {
        if let Some(gate) = self.gates.lock().await.remove(project_id) {
            gate.close();
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }

    pub async fn mutation_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.is_mutation())
            .count()
    }

    async fn enter(&self, project_id: &str, call: Call) -> Result<(), ApiError> {
        self.calls.lock().await.push(call);
        let gate = self.gates.lock().await.get(project_id).cloned();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        let delay = self.delays.lock().await.get(project_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().await.contains(project_id) {
            return Err(server_error());
        }
        Ok(())
    }
}

#[async_trait]
impl RevenueCatApi for FakeRevenueCat {
    async fn list_webhooks(&self, project_id: &str) -> Result<Vec<Webhook>, ApiError> {
        self.enter(project_id, Call::List(project_id.into())).await?;
        Ok(self.webhooks_of(project_id).await)
    }

    async fn create_webhook(
        &self,
        project_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError> {
        self.enter(project_id, Call::Create(project_id.into(), request.clone()))
            .await?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let hook = Webhook {
            id: Some(format!("wh-{project_id}-{n}")),
            name: Some(request.name.clone()),
            url: Some(request.url.clone()),
            environment: Some(request.environment.clone()),
        };
        self.webhooks
            .lock()
            .await
            .entry(project_id.to_string())
            .or_default()
            .push(hook.clone());
        Ok(hook)
    }

    async fn update_webhook(
        &self,
        project_id: &str,
        webhook_id: &str,
        request: &WebhookRequest,
    ) -> Result<Webhook, ApiError> {
        self.enter(
            project_id,
            Call::Update(project_id.into(), webhook_id.into(), request.clone()),
        )
        .await?;
        let mut hooks = self.webhooks.lock().await;
        let hook = hooks
            .get_mut(project_id)
            .and_then(|list| {
                list.iter_mut()
                    .find(|h| h.id.as_deref() == Some(webhook_id))
            })
            .ok_or(ApiError::Status {
                status: StatusCode::NOT_FOUND,
                body: "no such webhook".into(),
            })?;
        hook.name = Some(request.name.clone());
        hook.url = Some(request.url.clone());
        Ok(hook.clone())
    }

    async fn delete_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError> {
        self.enter(project_id, Call::Delete(project_id.into(), webhook_id.into()))
            .await?;
        if let Some(list) = self.webhooks.lock().await.get_mut(project_id) {
            list.retain(|h| h.id.as_deref() != Some(webhook_id));
        }
        Ok(())
    }

    async fn test_webhook(&self, project_id: &str, webhook_id: &str) -> Result<(), ApiError> {
        self.enter(project_id, Call::Test(project_id.into(), webhook_id.into()))
            .await
    }

    async fn latest_events(
        &self,
        project_id: &str,
        webhook_id: &str,
    ) -> Result<Vec<Event>, ApiError> {
        self.enter(project_id, Call::Events(project_id.into(), webhook_id.into()))
            .await?;
        Ok(self
            .events
            .lock()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Poll until `check` holds, yielding to the runtime in between.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}
