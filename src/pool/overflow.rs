use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{SaturationPolicy, Task};
use crate::error::{PipelineError, Result};
use crate::handler::panic_message;
use crate::monitoring::{Monitor, PipelineEvent};

/// Single worker draining an unbounded FIFO of tasks a pool could not take
///
/// Tasks run one at a time in the order they were handed over. Nothing
/// handed to a running runner is discarded.
pub struct OverflowRunner {
    name: String,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<Task>>>,
    pending: Arc<AtomicUsize>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl OverflowRunner {
    /// Spawn the runner's worker. Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_pending = pending.clone();
        let worker_name = name.clone();
        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    error!(
                        runner = %worker_name,
                        panic = %panic_message(&panic),
                        "Overflow task panicked"
                    );
                }
                worker_pending.fetch_sub(1, Ordering::AcqRel);
            }
            debug!(runner = %worker_name, "Overflow runner exiting");
        });

        Self {
            name,
            sender: parking_lot::Mutex::new(Some(tx)),
            pending,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Queue a task without waiting
    pub fn execute(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(PipelineError::OverflowClosed);
        };

        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(PipelineError::OverflowClosed);
        }
        Ok(())
    }

    /// Tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop accepting tasks and run what is queued, for at most `drain_timeout`.
    ///
    /// Returns how many tasks were left unfinished.
    pub async fn shutdown(&self, drain_timeout: Duration) -> usize {
        drop(self.sender.lock().take());
        let Some(mut handle) = self.handle.lock().take() else {
            return 0;
        };

        info!(runner = %self.name, pending = self.pending(), "Shutting down overflow runner");

        match tokio::time::timeout(drain_timeout, &mut handle).await {
            Ok(_) => 0,
            Err(_) => {
                handle.abort();
                let abandoned = self.pending();
                warn!(
                    runner = %self.name,
                    abandoned = abandoned,
                    timeout = ?drain_timeout,
                    "Overflow drain timed out"
                );
                abandoned
            }
        }
    }
}

/// Saturation policy that runs rejected tasks on an [`OverflowRunner`]
pub struct RunOnOverflow {
    runner: Arc<OverflowRunner>,
    monitor: Monitor,
}

impl RunOnOverflow {
    pub fn new(runner: Arc<OverflowRunner>) -> Self {
        Self {
            runner,
            monitor: Monitor::default(),
        }
    }

    pub(crate) fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }
}

impl SaturationPolicy for RunOnOverflow {
    fn on_saturated(&self, pool: &str, task: Task) -> Result<()> {
        debug!(
            pool = %pool,
            runner = %self.runner.name,
            pending = self.runner.pending(),
            "Pool saturated, running task on overflow runner"
        );
        self.monitor.send(PipelineEvent::overflowed(pool));
        self.runner.execute(task)
    }
}
