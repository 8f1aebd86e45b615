//! Bounded worker pool with a pluggable saturation policy
//!
//! The pool runs boxed futures on a set of Tokio worker tasks. It keeps
//! `core_workers` alive, grows up to `max_workers` before it starts queueing,
//! and lets extra workers retire after `keep_alive` of idleness. At most
//! `max_workers + queue_capacity` tasks are ever submitted-but-unfinished;
//! anything beyond that goes to the [`SaturationPolicy`] instead of blocking
//! the caller.

mod overflow;

pub use overflow::{OverflowRunner, RunOnOverflow};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::error::{PipelineError, Result};
use crate::handler::panic_message;

/// A unit of work accepted by the pool
pub type Task = BoxFuture<'static, ()>;

/// What to do with a task when both the workers and the queue are full
pub trait SaturationPolicy: Send + Sync {
    fn on_saturated(&self, pool: &str, task: Task) -> Result<()>;
}

/// Rejects the task with [`PipelineError::PoolSaturated`]
#[derive(Debug, Default, Clone)]
pub struct AbortPolicy;

impl SaturationPolicy for AbortPolicy {
    fn on_saturated(&self, pool: &str, _task: Task) -> Result<()> {
        warn!(pool = %pool, "Pool saturated, rejecting task");
        Err(PipelineError::PoolSaturated(pool.to_string()))
    }
}

/// Shape of a worker pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in logs and errors
    pub name: String,
    /// Workers that never retire
    pub core_workers: usize,
    pub max_workers: usize,
    /// How long a worker above `core_workers` may stay idle
    pub keep_alive: Duration,
    /// Tasks allowed to wait once every worker is busy
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, core_workers: usize, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            core_workers,
            max_workers,
            keep_alive: Duration::from_secs(30),
            queue_capacity: max_workers,
        }
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.core_workers == 0 || self.core_workers > self.max_workers {
            return Err(PipelineError::ConfigError(format!(
                "pool {}: need 1 <= core_workers ({}) <= max_workers ({})",
                self.name, self.core_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

struct PoolInner {
    config: PoolConfig,
    policy: Arc<dyn SaturationPolicy>,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    receiver: Mutex<mpsc::Receiver<Task>>,
    workers: parking_lot::Mutex<JoinSet<()>>,
    submitted: AtomicUsize,
    live_workers: AtomicUsize,
    capacity_freed: Notify,
    shut_down: AtomicBool,
}

/// A fixed-shape pool of Tokio worker tasks fed by a bounded queue
#[derive(Clone)]
pub struct BoundedWorkerPool {
    inner: Arc<PoolInner>,
}

impl BoundedWorkerPool {
    pub fn new(config: PoolConfig, policy: Arc<dyn SaturationPolicy>) -> Result<Self> {
        config.validate()?;

        // The channel can hold every admissible task, so the submitted
        // counter alone decides when the pool is saturated.
        let (tx, rx) = mpsc::channel(config.max_workers + config.queue_capacity);

        debug!(
            pool = %config.name,
            core_workers = config.core_workers,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            "Created worker pool"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                policy,
                sender: parking_lot::Mutex::new(Some(tx)),
                receiver: Mutex::new(rx),
                workers: parking_lot::Mutex::new(JoinSet::new()),
                submitted: AtomicUsize::new(0),
                live_workers: AtomicUsize::new(0),
                capacity_freed: Notify::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Hand a task to the pool without waiting.
    ///
    /// When the pool is saturated the task goes to the saturation policy and
    /// its result is returned.
    pub fn submit(&self, task: Task) -> Result<()> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(PipelineError::PoolShutdown(inner.config.name.clone()));
        }

        let limit = inner.config.max_workers + inner.config.queue_capacity;
        let count = inner.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        if count > limit {
            inner.submitted.fetch_sub(1, Ordering::AcqRel);
            trace!(pool = %inner.config.name, submitted = count - 1, "Pool saturated");
            return inner.policy.on_saturated(&inner.config.name, task);
        }

        self.ensure_worker(count);

        let sender = inner.sender.lock();
        let Some(tx) = sender.as_ref() else {
            inner.submitted.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::PoolShutdown(inner.config.name.clone()));
        };

        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => {
                inner.submitted.fetch_sub(1, Ordering::AcqRel);
                drop(sender);
                inner.policy.on_saturated(&inner.config.name, task)
            }
            Err(TrySendError::Closed(_)) => {
                inner.submitted.fetch_sub(1, Ordering::AcqRel);
                Err(PipelineError::PoolShutdown(inner.config.name.clone()))
            }
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.config.max_workers
    }

    /// Tasks queued or running
    pub fn submitted_count(&self) -> usize {
        self.inner.submitted.load(Ordering::Acquire)
    }

    /// Free worker slots, i.e. `max_workers - submitted_count`
    pub fn available_capacity(&self) -> usize {
        self.max_workers().saturating_sub(self.submitted_count())
    }

    pub fn live_workers(&self) -> usize {
        self.inner.live_workers.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Wait until at least one worker slot is free.
    ///
    /// Wakes on every task completion and re-checks at least every
    /// `poll_interval`.
    pub async fn wait_for_capacity(&self, poll_interval: Duration) {
        loop {
            let notified = self.inner.capacity_freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.available_capacity() > 0 {
                return;
            }

            trace!(
                pool = %self.name(),
                submitted = self.submitted_count(),
                "Waiting for pool capacity"
            );
            let _ = tokio::time::timeout(poll_interval, notified).await;
        }
    }

    /// Stop accepting tasks and let the workers drain the queue.
    ///
    /// Waits at most `drain_timeout`, then aborts the remaining workers.
    /// Returns how many submitted tasks were left unfinished.
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }

        drop(inner.sender.lock().take());
        let mut workers = std::mem::take(&mut *inner.workers.lock());

        info!(
            pool = %inner.config.name,
            submitted = self.submitted_count(),
            "Shutting down worker pool"
        );

        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    warn!(pool = %inner.config.name, error = %e, "Worker ended abnormally");
                }
            }
        })
        .await;

        if drained.is_ok() {
            info!(pool = %inner.config.name, "Worker pool drained");
            return 0;
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}

        let abandoned = self.submitted_count();
        warn!(
            pool = %inner.config.name,
            abandoned = abandoned,
            timeout = ?drain_timeout,
            "Drain timeout elapsed, abandoning unfinished tasks"
        );
        abandoned
    }

    /// Start another worker when there are more unfinished tasks than
    /// workers and the pool may still grow
    fn ensure_worker(&self, submitted: usize) {
        let inner = &self.inner;
        let mut live = inner.live_workers.load(Ordering::Acquire);
        while submitted > live && live < inner.config.max_workers {
            match inner.live_workers.compare_exchange(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let mut workers = inner.workers.lock();
                    while workers.try_join_next().is_some() {}
                    workers.spawn(worker_loop(inner.clone(), live + 1));
                    trace!(pool = %inner.config.name, live_workers = live + 1, "Spawned worker");
                    return;
                }
                Err(current) => live = current,
            }
        }
    }
}

enum Next {
    Task(Task),
    Closed,
    Idle,
}

async fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    let pool = inner.config.name.clone();
    trace!(pool = %pool, worker_id = worker_id, "Worker started");

    loop {
        // Only workers above the core size wait with a deadline
        let may_retire = inner.live_workers.load(Ordering::Acquire) > inner.config.core_workers;
        let recv = async { inner.receiver.lock().await.recv().await };

        let next = if may_retire {
            match tokio::time::timeout(inner.config.keep_alive, recv).await {
                Ok(Some(task)) => Next::Task(task),
                Ok(None) => Next::Closed,
                Err(_) => Next::Idle,
            }
        } else {
            match recv.await {
                Some(task) => Next::Task(task),
                None => Next::Closed,
            }
        };

        match next {
            Next::Task(task) => {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!(
                        pool = %pool,
                        worker_id = worker_id,
                        panic = %panic_message(&panic),
                        "Task panicked"
                    );
                }
                inner.submitted.fetch_sub(1, Ordering::AcqRel);
                inner.capacity_freed.notify_waiters();
            }
            Next::Closed => {
                inner.live_workers.fetch_sub(1, Ordering::AcqRel);
                trace!(pool = %pool, worker_id = worker_id, "Queue closed, worker exiting");
                return;
            }
            Next::Idle => {
                if try_retire(&inner) {
                    debug!(pool = %pool, worker_id = worker_id, "Idle worker retired");
                    return;
                }
            }
        }
    }
}

/// Give up a worker slot if the pool is above its core size
fn try_retire(inner: &PoolInner) -> bool {
    let mut live = inner.live_workers.load(Ordering::Acquire);
    while live > inner.config.core_workers {
        match inner.live_workers.compare_exchange(
            live,
            live - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(current) => live = current,
        }
    }
    false
}
