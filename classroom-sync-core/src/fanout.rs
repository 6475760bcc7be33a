//! Bounded fan-out over independent work items.
//!
//! Results come back index-aligned with the input: `results[i]` belongs to `items[i]`
//! however the handlers finish. At most `limit` handlers are in flight at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::debug;

use crate::error::SyncError;

/// Maximum parallel requests recommended by the classroom API usage limits.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Outcome of one work item after classification.
#[derive(Debug)]
pub enum WorkResult<T> {
    /// The remote call succeeded.
    Applied(T),
    /// Benign conflict: the remote already had it.
    AlreadyPresent,
    /// Benign absence: the remote already lacked it.
    AlreadyAbsent,
    /// Dry-run: the call was logged but not issued.
    Simulated,
    /// Not attempted for a local reason (unknown user, unregistered class).
    Skipped(String),
    Failed(SyncError),
    /// Never started because an earlier item failed in a fail-fast batch.
    Cancelled,
}

impl<T> WorkResult<T> {
    pub fn is_failure(&self) -> bool {
        matches!(self, WorkResult::Failed(_))
    }

    /// Success or benign outcome.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            WorkResult::Applied(_)
                | WorkResult::AlreadyPresent
                | WorkResult::AlreadyAbsent
                | WorkResult::Simulated
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkResult::Applied(_) => "applied",
            WorkResult::AlreadyPresent => "already_present",
            WorkResult::AlreadyAbsent => "already_absent",
            WorkResult::Simulated => "dry_run",
            WorkResult::Skipped(_) => "skipped",
            WorkResult::Failed(_) => "failed",
            WorkResult::Cancelled => "cancelled",
        }
    }

    /// Human-readable detail for failures and skips.
    pub fn detail(&self) -> String {
        match self {
            WorkResult::Failed(e) => format!("{}: {e}", e.tag()),
            WorkResult::Skipped(reason) => reason.clone(),
            _ => String::new(),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> WorkResult<U> {
        match self {
            WorkResult::Applied(value) => WorkResult::Applied(f(value)),
            WorkResult::AlreadyPresent => WorkResult::AlreadyPresent,
            WorkResult::AlreadyAbsent => WorkResult::AlreadyAbsent,
            WorkResult::Simulated => WorkResult::Simulated,
            WorkResult::Skipped(reason) => WorkResult::Skipped(reason),
            WorkResult::Failed(err) => WorkResult::Failed(err),
            WorkResult::Cancelled => WorkResult::Cancelled,
        }
    }

    pub fn applied(&self) -> Option<&T> {
        match self {
            WorkResult::Applied(value) => Some(value),
            _ => None,
        }
    }
}

/// A result tagged with the identifier it was dispatched for.
#[derive(Debug)]
pub struct Keyed<T> {
    pub key: String,
    pub result: WorkResult<T>,
}

impl<T> Keyed<T> {
    pub fn new(key: impl Into<String>, result: WorkResult<T>) -> Self {
        Self {
            key: key.into(),
            result,
        }
    }
}

/// Tally of outcomes across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub applied: usize,
    pub already_present: usize,
    pub already_absent: usize,
    pub simulated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn of<'a, T: 'a>(results: impl IntoIterator<Item = &'a WorkResult<T>>) -> Self {
        let mut summary = BatchSummary::default();
        for result in results {
            match result {
                WorkResult::Applied(_) => summary.applied += 1,
                WorkResult::AlreadyPresent => summary.already_present += 1,
                WorkResult::AlreadyAbsent => summary.already_absent += 1,
                WorkResult::Simulated => summary.simulated += 1,
                WorkResult::Skipped(_) => summary.skipped += 1,
                WorkResult::Failed(_) => summary.failed += 1,
                WorkResult::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.applied
            + self.already_present
            + self.already_absent
            + self.simulated
            + self.skipped
            + self.failed
            + self.cancelled
    }
}

/// Completed-item counter for the batch currently running.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    completed: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl Progress {
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn reset(&self, total: usize) {
        self.completed.store(0, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
    }

    fn tick(&self) -> usize {
        self.completed.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Runs handlers over a batch with a concurrency cap.
#[derive(Debug, Clone)]
pub struct FanOut {
    limit: usize,
    progress: Progress,
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl FanOut {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            progress: Progress::default(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Shared handle on the completed-item counter.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Run `handler` over every item. Never aborts; returns one result per item, in
    /// input order.
    pub async fn run<I, R, F, Fut>(&self, items: Vec<I>, handler: F) -> Vec<R>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = R>,
    {
        let total = items.len();
        self.progress.reset(total);
        let progress = &self.progress;
        let handler = &handler;
        stream::iter(items)
            .map(|item| async move {
                let result = handler(item).await;
                let done = progress.tick();
                debug!(done, total, "Fan-out item completed");
                result
            })
            .buffered(self.limit)
            .collect()
            .await
    }

    /// Like [`FanOut::run`], but once any item fails no further items are started;
    /// those are reported as [`WorkResult::Cancelled`]. Items already in flight finish.
    pub async fn run_until_fatal<I, T, F, Fut>(&self, items: Vec<I>, handler: F) -> Vec<WorkResult<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = WorkResult<T>>,
    {
        let aborted = AtomicBool::new(false);
        let aborted = &aborted;
        let handler = &handler;
        self.run(items, move |item| async move {
            if aborted.load(Ordering::SeqCst) {
                return WorkResult::Cancelled;
            }
            let result = handler(item).await;
            if result.is_failure() {
                aborted.store(true, Ordering::SeqCst);
            }
            result
        })
        .await
    }
}
