//! Write-back of webhook associations into the project store.

use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::model::{Project, WebhookItem, WebhookState};
use crate::store::ProjectStore;

/// Compute the next project list from `snapshot` and resolved row states.
///
/// `Active` sets the association, `Inactive` clears it. `Loading` and
/// `Errored` rows leave the stored association as it was. Projects with no
/// matching row are returned unchanged.
pub fn reconcile(snapshot: &[Project], states: &[WebhookItem]) -> Vec<Project> {
    let by_id: HashMap<&str, &WebhookState> = states
        .iter()
        .map(|item| (item.project.id.as_str(), &item.state))
        .collect();

    snapshot
        .iter()
        .map(|project| {
            let mut next = project.clone();
            match by_id.get(project.id.as_str()) {
                Some(WebhookState::Active(webhook_id)) => next.webhook_id = Some(webhook_id.clone()),
                Some(WebhookState::Inactive) => next.webhook_id = None,
                Some(WebhookState::Loading | WebhookState::Errored(_)) | None => {}
            }
            next
        })
        .collect()
}

/// Reconcile against the store's current contents and commit once, under the
/// store's write guard.
#[instrument(skip_all, fields(states = states.len()))]
pub async fn commit(store: &ProjectStore, states: &[WebhookItem]) -> Vec<Project> {
    let committed = store.update(|current| reconcile(current, states)).await;
    debug!(projects = committed.len(), "webhook associations committed");
    committed
}
