//! Shared project store: the entity source every run reads from and the
//! reconciler writes back to.
//!
//! Reads hand out owned snapshots. All writes go through one mutation guard so
//! a writer never observes another writer's half-applied list.

use crate::model::Project;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug)]
struct Inner {
    projects: Vec<Project>,
    identity: String,
    revision: u64,
}

/// Cheap to clone; clones share the same underlying state.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    inner: Arc<RwLock<Inner>>,
}

impl ProjectStore {
    /// Create a store with the given projects and a freshly generated identity.
    pub fn new(projects: Vec<Project>) -> Self {
        Self::with_identity(projects, new_identity())
    }

    pub fn with_identity(projects: Vec<Project>, identity: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                projects,
                identity: identity.into(),
                revision: 0,
            })),
        }
    }

    pub async fn snapshot(&self) -> Vec<Project> {
        self.inner.read().await.projects.clone()
    }

    pub async fn identity(&self) -> String {
        self.inner.read().await.identity.clone()
    }

    /// Number of committed writes so far.
    pub async fn revision(&self) -> u64 {
        self.inner.read().await.revision
    }

    /// Replace the whole project list in one write.
    pub async fn replace(&self, projects: Vec<Project>) {
        let mut guard = self.inner.write().await;
        guard.projects = projects;
        guard.revision += 1;
        debug!(revision = guard.revision, "project store replaced");
    }

    /// Compute the next list from the current one while holding the write
    /// guard, then commit it once. Concurrent updates are serialized.
    pub async fn update<F>(&self, next: F) -> Vec<Project>
    where
        F: FnOnce(&[Project]) -> Vec<Project>,
    {
        let mut guard = self.inner.write().await;
        let projects = next(&guard.projects);
        guard.projects = projects.clone();
        guard.revision += 1;
        debug!(revision = guard.revision, "project store updated");
        projects
    }

    /// Replace the caller identity with a new random one and return it.
    pub async fn regenerate_identity(&self) -> String {
        let identity = new_identity();
        let mut guard = self.inner.write().await;
        guard.identity = identity.clone();
        guard.revision += 1;
        info!("caller identity regenerated");
        identity
    }
}

fn new_identity() -> String {
    Uuid::new_v4().to_string()
}
