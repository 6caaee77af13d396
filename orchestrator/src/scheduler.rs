//! Worker pool: bounded threads that claim `PENDING` tasks and run them.
//!
//! Claiming goes through [`TaskStore::claim_next`](crate::io::store::TaskStore::claim_next),
//! which combines lease acquisition with `PENDING → RUNNING`, so two workers can
//! never hold the same task. A worker that errors or panics moves its task to
//! `FAILED`; the lease is released either way.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::core::types::TaskState;
use crate::step::StepEngine;

/// Shutdown signal shared by the workers and the janitor thread.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`. Returns true once shutdown was triggered.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers polling every `poll_interval`.
    pub fn start(
        engine: &StepEngine,
        concurrency: usize,
        poll_interval: Duration,
        shutdown: &Shutdown,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(concurrency);
        for n in 1..=concurrency.max(1) {
            let worker_id = format!("worker-{n}");
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker_loop(&engine, &worker_id, poll_interval, &shutdown))
                .with_context(|| format!("spawn worker {n}"))?;
            handles.push(handle);
        }
        info!(workers = handles.len(), "worker pool started");
        Ok(Self { handles })
    }

    /// Wait for every worker to exit. Trigger the [`Shutdown`] first.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                warn!("worker thread panicked outside a task run");
            }
        }
    }
}

fn worker_loop(engine: &StepEngine, worker_id: &str, poll_interval: Duration, shutdown: &Shutdown) {
    debug!(worker = worker_id, "worker started");
    while !shutdown.is_triggered() {
        match tick(engine, worker_id) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(err) => error!(worker = worker_id, err = %format!("{err:#}"), "worker tick failed"),
        }
        if shutdown.wait(poll_interval) {
            break;
        }
    }
    debug!(worker = worker_id, "worker stopped");
}

/// Claim and run at most one task. Returns the task id and the state it
/// settled in, or `None` when nothing was eligible.
pub fn tick(engine: &StepEngine, worker_id: &str) -> Result<Option<(String, TaskState)>> {
    let controller = engine.controller();
    let store = controller.store();
    let Some(lease) = store.claim_next(worker_id)? else {
        return Ok(None);
    };
    info!(task_id = %lease.task_id, worker = worker_id, "task claimed");

    let failure = match panic::catch_unwind(AssertUnwindSafe(|| engine.run_task(&lease))) {
        Ok(Ok(_)) => None,
        Ok(Err(err)) => Some(format!("{err:#}")),
        Err(payload) => Some(format!("worker panicked: {}", panic_message(payload.as_ref()))),
    };

    let mut state = store.require_task(&lease.task_id)?.state;
    if let Some(message) = failure {
        error!(task_id = %lease.task_id, err = %message, "task run failed");
        if state.is_inflight() {
            match controller.fail(&lease.task_id, &message, worker_id) {
                Ok(task) => state = task.state,
                Err(err) => error!(task_id = %lease.task_id, err = %format!("{err:#}"), "could not mark task failed"),
            }
        }
    }
    store.release_lease(&lease)?;
    Ok(Some((lease.task_id, state)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
