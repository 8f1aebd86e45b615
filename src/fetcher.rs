//! Per-stream fetch loop and the stage-2 task it submits
//!
//! A [`FetchWorker`] owns one stream for its whole life. It runs stage 1
//! inline, so stage 1 sees a topic's messages in stream order, and hands
//! stage 2 to the process pool. Before every pull it waits for a free process
//! worker, which keeps the fetch side from running ahead of processing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::broker::MessageStream;
use crate::handler::{guarded, panic_message, MessageHandler};
use crate::message::Message;
use crate::monitoring::{FetchExit, Monitor, PipelineEvent};
use crate::pool::{BoundedWorkerPool, Task};
use crate::reprocess::{ErrorReprocessor, FailedMessage};
use crate::retry::shutdown_signalled;

/// Shared by every stage-2 task
#[derive(Clone)]
pub(crate) struct StageTwoContext {
    pub reprocessor: Arc<ErrorReprocessor>,
    pub monitor: Monitor,
    /// Stage-2 calls slower than this are logged
    pub slow_threshold: Duration,
}

/// Shared by every fetch worker
#[derive(Clone)]
pub(crate) struct FetchContext {
    pub process_pool: BoundedWorkerPool,
    pub stage_two: StageTwoContext,
    pub poll_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
    pub monitor: Monitor,
}

/// Drives one topic stream through stage 1 and into the process pool
pub struct FetchWorker<S: MessageStream> {
    topic: String,
    stream: S,
    handler: Arc<dyn MessageHandler>,
    ctx: FetchContext,
}

impl<S: MessageStream> FetchWorker<S> {
    pub(crate) fn new(
        topic: impl Into<String>,
        stream: S,
        handler: Arc<dyn MessageHandler>,
        ctx: FetchContext,
    ) -> Self {
        Self {
            topic: topic.into(),
            stream,
            handler,
            ctx,
        }
    }

    /// Run until the stream ends, fails, or shutdown is signalled
    pub async fn run(mut self) -> FetchExit {
        info!(
            topic = %self.topic,
            handler = %self.handler.name(),
            "Starting fetch worker"
        );
        self.ctx.monitor.send(PipelineEvent::fetch_started(&self.topic));

        let exit = self.fetch_loop().await;

        match exit {
            FetchExit::EndOfStream => info!(topic = %self.topic, "Stream ended"),
            FetchExit::Interrupted => info!(topic = %self.topic, "Fetch worker interrupted"),
            FetchExit::StreamError => warn!(topic = %self.topic, "Fetch worker stopped on stream error"),
        }
        self.ctx
            .monitor
            .send(PipelineEvent::fetch_stopped(&self.topic, exit));
        exit
    }

    async fn fetch_loop(&mut self) -> FetchExit {
        loop {
            let has_next = select! {
                result = self.stream.has_next() => result,
                _ = shutdown_signalled(&mut self.ctx.shutdown) => return FetchExit::Interrupted,
            };

            match has_next {
                Ok(true) => {}
                Ok(false) => return FetchExit::EndOfStream,
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "Stream failed");
                    return FetchExit::StreamError;
                }
            }

            select! {
                _ = self.ctx.process_pool.wait_for_capacity(self.ctx.poll_interval) => {}
                _ = shutdown_signalled(&mut self.ctx.shutdown) => return FetchExit::Interrupted,
            }

            let delivered = match self.stream.next_message().await {
                Ok(delivered) => delivered,
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "Failed to pull message");
                    continue;
                }
            };
            let message = Arc::new(Message::from_delivered(&self.topic, delivered));
            trace!(topic = %message.topic(), offset = ?message.offset(), "Pulled message");

            if let Err(e) = guarded(self.handler.p1_process(&message)).await {
                error!(
                    topic = %message.topic(),
                    handler = %self.handler.name(),
                    offset = ?message.offset(),
                    error = %e,
                    "Stage-1 processing failed, skipping stage 2"
                );
                self.ctx
                    .monitor
                    .send(PipelineEvent::stage1_failure(message.topic(), e.to_string()));
                continue;
            }

            let task = stage_two(
                message.clone(),
                self.handler.clone(),
                self.ctx.stage_two.clone(),
            );
            if let Err(e) = self.ctx.process_pool.submit(task) {
                error!(
                    topic = %message.topic(),
                    offset = ?message.offset(),
                    error = %e,
                    "Failed to submit stage-2 task, message dropped"
                );
            }
        }
    }
}

/// Build the stage-2 task for one message.
///
/// Runs `p2_process`; on failure asks the handler to resolve it and hands
/// the message to the error reprocessor when it does not.
pub(crate) fn stage_two(
    message: Arc<Message>,
    handler: Arc<dyn MessageHandler>,
    ctx: StageTwoContext,
) -> Task {
    Box::pin(async move {
        let start = Instant::now();
        let result = guarded(handler.p2_process(&message)).await;
        let elapsed = start.elapsed();

        let e = match result {
            Ok(()) => {
                if elapsed > ctx.slow_threshold {
                    debug!(
                        topic = %message.topic(),
                        handler = %handler.name(),
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Slow stage-2 processing"
                    );
                }
                ctx.monitor
                    .send(PipelineEvent::stage2_complete(message.topic(), elapsed));
                return;
            }
            Err(e) => e,
        };

        let resolved = match AssertUnwindSafe(handler.on_process_error(&message, &e))
            .catch_unwind()
            .await
        {
            Ok(resolved) => resolved,
            Err(panic) => {
                warn!(
                    topic = %message.topic(),
                    handler = %handler.name(),
                    panic = %panic_message(&panic),
                    "Error hook panicked, treating failure as unresolved"
                );
                false
            }
        };

        error!(
            topic = %message.topic(),
            handler = %handler.name(),
            offset = ?message.offset(),
            error = %e,
            resolved = resolved,
            "Stage-2 processing failed"
        );

        if !resolved {
            let failed = FailedMessage::new(message.clone(), handler.clone(), e.to_string());
            if let Err(submit_err) = ctx.reprocessor.submit(failed) {
                error!(
                    topic = %message.topic(),
                    error = %submit_err,
                    "Could not hand message to error reprocessor"
                );
            }
        }

        ctx.monitor.send(PipelineEvent::stage2_failure(
            message.topic(),
            e.to_string(),
            resolved,
        ));
    })
}
