//! Bounded worker pool with explicit task handles and a join barrier.
//!
//! Each pool owns its own rayon `ThreadPool` instead of the global one so
//! the stage pool and the nested intersection pool never share workers.
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver};
use log::debug;
use std::any::Any;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// Every failed unit of one barrier, in submission order.
#[derive(Debug, Error)]
#[error("{} of {total} task(s) failed: {}", failures.len(), failures.join("; "))]
pub struct StageFailure {
    pub failures: Vec<String>,
    pub total: usize,
}

pub struct TaskPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

/// Handle to one submitted unit. Resolves to its value or to the captured
/// error / panic message.
pub struct TaskHandle<T> {
    label: String,
    rx: Receiver<std::result::Result<T, String>>,
}

impl<T> TaskHandle<T> {
    pub fn join(self) -> std::result::Result<T, String> {
        match self.rx.recv() {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(msg)) => Err(format!("{}: {msg}", self.label)),
            Err(_) => Err(format!("{}: task dropped before completion", self.label)),
        }
    }
}

impl TaskPool {
    pub fn new(workers: usize, name: &str) -> Result<Self> {
        if workers == 0 {
            anyhow::bail!("worker count must be at least 1");
        }
        let prefix = name.to_owned();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .with_context(|| format!("build {name} pool with {workers} workers"))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `f` on the pool. Errors and panics are both captured in the
    /// handle; nothing is retried.
    pub fn submit<T, F>(&self, label: impl Into<String>, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = bounded(1);
        self.pool.spawn(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(format!("{e:#}")),
                Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
            };
            // receiver gone means nobody waits for this unit any more
            let _ = tx.send(outcome);
        });
        TaskHandle { label, rx }
    }

    /// Barrier: waits for every handle, then reports either all values
    /// (in submission order) or all failures. A failing unit never cancels
    /// its siblings.
    pub fn await_all<T>(handles: Vec<TaskHandle<T>>) -> std::result::Result<Vec<T>, StageFailure> {
        let total = handles.len();
        let mut values = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for h in handles {
            match h.join() {
                Ok(v) => values.push(v),
                Err(msg) => failures.push(msg),
            }
        }
        debug!("barrier joined {total} task(s), {} failed", failures.len());
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(StageFailure { failures, total })
        }
    }

    /// Runs `op` inside this pool so rayon parallel iterators use its
    /// workers. Safe to call from a worker of a *different* pool.
    pub fn install<R, OP>(&self, op: OP) -> R
    where
        R: Send,
        OP: FnOnce() -> R + Send,
    {
        self.pool.install(op)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Contiguous ranges covering `0..len` split into at most `parts` pieces
/// whose sizes differ by at most one; the first `len % parts` pieces carry
/// the extra element. Empty pieces are dropped.
pub fn balanced_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1);
    let (k, m) = (len / parts, len % parts);
    (0..parts)
        .map(|i| (i * k + i.min(m))..((i + 1) * k + (i + 1).min(m)))
        .filter(|r| !r.is_empty())
        .collect()
}

/// Partitions `items` along [`balanced_ranges`], keeping order.
pub fn split_balanced<T>(items: Vec<T>, parts: usize) -> Vec<Vec<T>> {
    let ranges = balanced_ranges(items.len(), parts);
    let mut it = items.into_iter();
    ranges
        .into_iter()
        .map(|r| it.by_ref().take(r.len()).collect())
        .collect()
}
