//! Error reprocessor for messages whose stage 2 failed unresolved
//!
//! Failed messages are queued without bound and picked up by a small fixed
//! set of workers. Each worker applies a [`ReprocessStrategy`]; whatever the
//! strategy gives up on is logged and, when configured, handed to a
//! [`DeadLetterSink`].

mod strategy;

pub use strategy::{DropStrategy, ReprocessStrategy, RetryStrategy};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::handler::{panic_message, MessageHandler};
use crate::message::Message;
use crate::monitoring::{Monitor, PipelineEvent};
use crate::retry::{ExponentialBackoff, RetryConfig};

/// A message handed over after its handler declined to resolve a failure
#[derive(Clone)]
pub struct FailedMessage {
    pub message: Arc<Message>,
    pub handler: Arc<dyn MessageHandler>,
    /// Text of the stage-2 error that caused the hand-over
    pub error: String,
}

impl FailedMessage {
    pub fn new(
        message: Arc<Message>,
        handler: Arc<dyn MessageHandler>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            message,
            handler,
            error: error.into(),
        }
    }
}

impl std::fmt::Debug for FailedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedMessage")
            .field("topic", &self.message.topic())
            .field("offset", &self.message.offset())
            .field("handler", &self.handler.name())
            .field("error", &self.error)
            .finish()
    }
}

/// Terminal state of a reprocessed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprocessOutcome {
    Recovered { attempts: u32 },
    Dropped { attempts: u32, reason: String },
}

const INTERRUPTED: &str = "interrupted by shutdown";

impl ReprocessOutcome {
    pub(crate) fn interrupted(attempts: u32) -> Self {
        ReprocessOutcome::Dropped {
            attempts,
            reason: INTERRUPTED.to_string(),
        }
    }

    pub fn is_recovered(&self) -> bool {
        matches!(self, ReprocessOutcome::Recovered { .. })
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ReprocessOutcome::Dropped { reason, .. } if reason == INTERRUPTED)
    }
}

/// Receives messages the reprocessor gave up on
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, failed: &FailedMessage, reason: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
struct ReprocessStats {
    submitted: AtomicU64,
    recovered: AtomicU64,
    dropped: AtomicU64,
}

/// Builder for [`ErrorReprocessor`]
pub struct ReprocessorBuilder {
    concurrency: usize,
    strategy: Arc<dyn ReprocessStrategy>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    monitor: Monitor,
}

impl Default for ReprocessorBuilder {
    fn default() -> Self {
        Self {
            concurrency: 1,
            strategy: Arc::new(RetryStrategy::<ExponentialBackoff>::from_config(
                RetryConfig::default(),
            )),
            dead_letter: None,
            monitor: Monitor::default(),
        }
    }
}

impl ReprocessorBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn ReprocessStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub(crate) fn monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Spawn the workers. Must be called inside a Tokio runtime.
    pub fn build(self) -> ErrorReprocessor {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(Mutex::new(rx));
        let stats = Arc::new(ReprocessStats::default());

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency {
            workers.spawn(worker_loop(Worker {
                id: worker_id,
                queue: queue.clone(),
                strategy: self.strategy.clone(),
                dead_letter: self.dead_letter.clone(),
                stats: stats.clone(),
                monitor: self.monitor.clone(),
                shutdown: shutdown_rx.clone(),
            }));
        }

        debug!(concurrency = self.concurrency, "Started error reprocessor");

        ErrorReprocessor {
            sender: parking_lot::Mutex::new(Some(tx)),
            shutdown_tx,
            workers: Mutex::new(workers),
            stats,
            closed: AtomicBool::new(false),
        }
    }
}

/// Accepts failed messages and works them off in the background
pub struct ErrorReprocessor {
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<FailedMessage>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
    stats: Arc<ReprocessStats>,
    closed: AtomicBool,
}

impl ErrorReprocessor {
    pub fn builder() -> ReprocessorBuilder {
        ReprocessorBuilder::default()
    }

    /// Queue a failed message without waiting
    pub fn submit(&self, failed: FailedMessage) -> Result<()> {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(PipelineError::ReprocessorClosed);
        };

        tx.send(failed)
            .map_err(|_| PipelineError::ReprocessorClosed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Messages accepted so far
    pub fn submitted(&self) -> u64 {
        self.stats.submitted.load(Ordering::Relaxed)
    }

    pub fn recovered(&self) -> u64 {
        self.stats.recovered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting messages and work off the backlog.
    ///
    /// After `drain_timeout` the workers are told to stop; messages still
    /// in a backoff or in the queue are dropped as interrupted. Calling
    /// this more than once is harmless.
    pub async fn close(&self, drain_timeout: Duration) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.sender.lock().take());

        info!(
            submitted = self.submitted(),
            recovered = self.recovered(),
            dropped = self.dropped(),
            "Closing error reprocessor"
        );

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(drain_timeout, join_all(&mut workers)).await;

        if drained.is_err() {
            warn!(timeout = ?drain_timeout, "Error reprocessor drain timed out, interrupting workers");
            self.shutdown_tx.send(true).ok();
            if tokio::time::timeout(drain_timeout, join_all(&mut workers))
                .await
                .is_err()
            {
                warn!("Error reprocessor workers did not stop, aborting");
                workers.abort_all();
                join_all(&mut workers).await;
            }
        }

        info!(
            recovered = self.recovered(),
            dropped = self.dropped(),
            "Error reprocessor closed"
        );
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            if !e.is_cancelled() {
                error!(error = %e, "Reprocess worker ended abnormally");
            }
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<FailedMessage>>>,
    strategy: Arc<dyn ReprocessStrategy>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    stats: Arc<ReprocessStats>,
    monitor: Monitor,
    shutdown: watch::Receiver<bool>,
}

async fn worker_loop(mut worker: Worker) {
    loop {
        let next = { worker.queue.lock().await.recv().await };
        let Some(failed) = next else {
            debug!(worker_id = worker.id, "Reprocess queue closed, worker exiting");
            return;
        };

        let outcome = if *worker.shutdown.borrow() {
            ReprocessOutcome::interrupted(0)
        } else {
            let strategy = worker.strategy.clone();
            match AssertUnwindSafe(strategy.reprocess(&failed, &mut worker.shutdown))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => ReprocessOutcome::Dropped {
                    attempts: 0,
                    reason: format!("strategy panicked: {}", panic_message(&panic)),
                },
            }
        };

        worker.settle(&failed, outcome).await;
    }
}

impl Worker {
    async fn settle(&self, failed: &FailedMessage, outcome: ReprocessOutcome) {
        let topic = failed.message.topic();
        match outcome {
            ReprocessOutcome::Recovered { attempts } => {
                self.stats.recovered.fetch_add(1, Ordering::Relaxed);
                info!(
                    topic = %topic,
                    handler = %failed.handler.name(),
                    attempts = attempts,
                    "Reprocessed failed message"
                );
                self.monitor.send(PipelineEvent::reprocessed(topic, attempts));
            }
            ReprocessOutcome::Dropped { attempts, reason } => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %topic,
                    handler = %failed.handler.name(),
                    offset = ?failed.message.offset(),
                    attempts = attempts,
                    reason = %reason,
                    original_error = %failed.error,
                    "Giving up on failed message"
                );

                if let Some(sink) = &self.dead_letter {
                    match AssertUnwindSafe(sink.dead_letter(failed, &reason))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            error!(topic = %topic, error = %e, "Failed to record dead letter")
                        }
                        Err(panic) => error!(
                            topic = %topic,
                            panic = %panic_message(&panic),
                            "Dead-letter sink panicked"
                        ),
                    }
                }
                self.monitor
                    .send(PipelineEvent::reprocess_dropped(topic, attempts, reason));
            }
        }
    }
}
