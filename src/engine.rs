//! Fan-out/fan-in over projects.
//!
//! [`run`] spawns one task per project against a [`Fetcher`], waits for every
//! task, and returns one [`Outcome`] per project id. Tasks never share an
//! accumulator: each returns `(project_id, outcome)` and the collecting loop
//! is the only writer of the [`RunResult`].
//!
//! A unit's failure (including a panic inside the fetcher) is captured as
//! [`Outcome::Failure`] for that project only. Cancelling the token aborts
//! every unit and discards whatever was already collected.

use crate::model::{FetchFailure, Outcome, Project};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outcomes of one run keyed by project id.
pub type RunResult<T> = HashMap<String, Outcome<T>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error("fetch unit failed to join: {0}")]
    Join(String),
    #[error("run collected {collected} outcomes for {expected} projects")]
    Incomplete { expected: usize, collected: usize },
}

/// Per-project remote work for one use case. Implementations convert every
/// failure into [`Outcome::Failure`] instead of returning an error.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn fetch(&self, project: &Project) -> Outcome<Self::Output>;
}

/// Adapts an async closure into a [`Fetcher`].
pub struct FnFetcher<F>(pub F);

#[async_trait]
impl<F, Fut, T> Fetcher for FnFetcher<F>
where
    F: Fn(Project) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn fetch(&self, project: &Project) -> Outcome<T> {
        (self.0)(project.clone()).await
    }
}

/// Run `fetcher` once per project concurrently and collect every outcome.
///
/// Duplicate project ids are fetched once; the first occurrence wins.
#[instrument(skip_all, fields(entities = projects.len()))]
pub async fn run<F: Fetcher>(
    projects: &[Project],
    fetcher: Arc<F>,
    cancel: &CancellationToken,
) -> Result<RunResult<F::Output>, RunError> {
    let mut results = RunResult::with_capacity(projects.len());
    if projects.is_empty() {
        return Ok(results);
    }
    if cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    let mut units = JoinSet::new();
    let mut seen = HashSet::with_capacity(projects.len());
    for project in projects {
        if !seen.insert(project.id.as_str()) {
            warn!(project_id = %project.id, "duplicate project in run; fetching once");
            continue;
        }
        let fetcher = fetcher.clone();
        let project = project.clone();
        let token = cancel.child_token();
        units.spawn(async move {
            let outcome = tokio::select! {
                _ = token.cancelled() => return None,
                res = AssertUnwindSafe(fetcher.fetch(&project)).catch_unwind() => match res {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        warn!(project_id = %project.id, panic = %message, "fetch unit panicked");
                        Outcome::Failure(FetchFailure::Panicked(message))
                    }
                },
            };
            debug!(project_id = %project.id, outcome = outcome.as_str(), "fetch unit finished");
            Some((project.id, outcome))
        });
    }
    let expected = units.len();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                units.abort_all();
                info!(collected = results.len(), expected, "run cancelled; discarding partial results");
                return Err(RunError::Cancelled);
            }
            next = units.join_next() => match next {
                None => break,
                Some(Ok(Some((id, outcome)))) => {
                    results.insert(id, outcome);
                }
                // The unit saw the token first; the next iteration reports it.
                Some(Ok(None)) => {}
                Some(Err(err)) => {
                    units.abort_all();
                    return Err(RunError::Join(err.to_string()));
                }
            }
        }
    }

    if cancel.is_cancelled() {
        info!(collected = results.len(), expected, "run cancelled; discarding partial results");
        return Err(RunError::Cancelled);
    }
    if results.len() != expected {
        return Err(RunError::Incomplete {
            expected,
            collected: results.len(),
        });
    }

    let failures = results.values().filter(|o| o.is_failure()).count();
    info!(expected, failures, "run complete");
    Ok(results)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bookkeeping for the refreshes of one presentation surface.
///
/// Starting a refresh cancels the one in flight. `before` holds what the
/// surface showed ahead of the oldest unfinished refresh, so an explicit
/// cancel can put it back while a superseded refresh leaves it alone.
#[derive(Debug)]
pub struct RefreshSlot<S> {
    generation: u64,
    token: CancellationToken,
    before: Option<S>,
}

impl<S> Default for RefreshSlot<S> {
    fn default() -> Self {
        Self {
            generation: 0,
            token: CancellationToken::new(),
            before: None,
        }
    }
}

impl<S> RefreshSlot<S> {
    /// Supersede the running refresh and start a new one.
    pub fn begin(&mut self, before: S) -> (u64, CancellationToken) {
        self.token.cancel();
        self.token = CancellationToken::new();
        self.generation += 1;
        self.before.get_or_insert(before);
        (self.generation, self.token.clone())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Refresh `generation` published its result.
    pub fn finish(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.before = None;
        }
    }

    /// What to restore after refresh `generation` was cancelled. `None` when
    /// a newer refresh owns the surface.
    pub fn abandon(&mut self, generation: u64) -> Option<S> {
        if self.is_current(generation) {
            self.before.take()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let fetcher = Arc::new(FnFetcher(move |_p: Project| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Outcome::<()>::Empty }
        }));
        let res = run(&[], fetcher, &CancellationToken::new()).await.unwrap();
        assert!(res.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_ids_collapse_to_one_entry() {
        let fetcher = Arc::new(FnFetcher(|p: Project| async move { Outcome::Success(p.id) }));
        let projects = vec![Project::new("a"), Project::new("a"), Project::new("b")];
        let res = run(&projects, fetcher, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res.len(), 2);
    }

    #[tokio::test]
    async fn panicking_unit_becomes_failure() {
        let fetcher = Arc::new(FnFetcher(|p: Project| async move {
            if p.id == "boom" {
                panic!("kaboom");
            }
            Outcome::Success(1u8)
        }));
        let projects = vec![Project::new("ok"), Project::new("boom")];
        let res = run(&projects, fetcher, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(res["ok"], Outcome::Success(1));
        assert_eq!(
            res["boom"],
            Outcome::Failure(FetchFailure::Panicked("kaboom".into()))
        );
    }

    #[tokio::test]
    async fn pre_cancelled_token_yields_no_result() {
        let fetcher = Arc::new(FnFetcher(|_p: Project| async { Outcome::Success(()) }));
        let token = CancellationToken::new();
        token.cancel();
        let err = run(&[Project::new("a")], fetcher, &token).await.unwrap_err();
        assert_eq!(err, RunError::Cancelled);
    }

    #[test]
    fn refresh_slot_restores_only_for_latest_refresh() {
        let mut slot = RefreshSlot::default();
        let (first, first_token) = slot.begin("settled");
        let (second, second_token) = slot.begin("loading");
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());

        // The superseded refresh restores nothing.
        assert_eq!(slot.abandon(first), None);
        // The chain keeps the view from before its first refresh.
        slot.cancel();
        assert!(second_token.is_cancelled());
        assert_eq!(slot.abandon(second), Some("settled"));
    }

    #[test]
    fn finished_refresh_clears_restore_point() {
        let mut slot = RefreshSlot::default();
        let (generation, _) = slot.begin(1);
        slot.finish(generation);
        let (next, _) = slot.begin(2);
        assert_eq!(slot.abandon(next), Some(2));
        assert_eq!(slot.abandon(next), None);
    }
}
