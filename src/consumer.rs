//! Topic consumer wiring the fetch side, the process pool and the error path
//!
//! [`TopicConsumer`] owns every component of the pipeline:
//!
//! - a fetch pool with one slot per topic stream, each running a [`FetchWorker`]
//! - a bounded process pool for stage 2, spilling into an [`OverflowRunner`]
//! - an [`ErrorReprocessor`] for stage-2 failures the handlers leave unresolved
//!
//! `start` requests the streams and launches the fetch workers; `close`
//! tears everything down in a fixed order and commits offsets once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerConnector;
use crate::codec::{Deserializer, DeserializerRegistry};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetcher::{FetchContext, FetchWorker, StageTwoContext};
use crate::handler::MessageHandler;
use crate::monitoring::{LifecycleStep, Monitor, PipelineEvent};
use crate::pool::{AbortPolicy, BoundedWorkerPool, OverflowRunner, PoolConfig, RunOnOverflow};
use crate::reprocess::{ErrorReprocessor, ReprocessorBuilder, RetryStrategy};
use crate::retry::ExponentialBackoff;

const FETCH_POOL: &str = "fetcher";
const PROCESS_POOL: &str = "processor";
const OVERFLOW_RUNNER: &str = "process-overflow";

/// Where a consumer is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Idle,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Closing,
            _ => LifecycleState::Closed,
        }
    }
}

/// Optional collaborators for [`TopicConsumer::with_options`]
pub struct ConsumerOptions {
    /// Where the `value.deserializer` property is looked up
    pub registry: DeserializerRegistry,
    /// Replaces the reprocessor derived from the retry config
    pub reprocessor: Option<ReprocessorBuilder>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            registry: DeserializerRegistry::with_defaults(),
            reprocessor: None,
        }
    }
}

/// Two-stage consumer over the topics of one broker connection
pub struct TopicConsumer<B: BrokerConnector> {
    config: PipelineConfig,
    connector: B,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    deserializer: Arc<dyn Deserializer>,
    fetch_pool: BoundedWorkerPool,
    process_pool: BoundedWorkerPool,
    overflow: Arc<OverflowRunner>,
    reprocessor: Arc<ErrorReprocessor>,
    state: AtomicU8,
    state_changed: Notify,
    shutdown_tx: watch::Sender<bool>,
    monitor: Monitor,
}

impl<B: BrokerConnector> TopicConsumer<B> {
    /// Build a consumer with the built-in deserializers and the default
    /// reprocessor. Must be called inside a Tokio runtime.
    ///
    /// Returns the monitoring receiver when monitoring is enabled.
    pub fn new(
        config: PipelineConfig,
        connector: B,
        handlers: HashMap<String, Arc<dyn MessageHandler>>,
    ) -> Result<(Self, Option<mpsc::Receiver<PipelineEvent>>)> {
        Self::with_options(config, connector, handlers, ConsumerOptions::default())
    }

    pub fn with_options(
        config: PipelineConfig,
        connector: B,
        handlers: HashMap<String, Arc<dyn MessageHandler>>,
        options: ConsumerOptions,
    ) -> Result<(Self, Option<mpsc::Receiver<PipelineEvent>>)> {
        config.validate()?;
        if handlers.is_empty() {
            return Err(PipelineError::ConfigError(
                "at least one topic handler is required".to_string(),
            ));
        }

        let deserializer = options.registry.resolve_from_properties(&config.properties)?;
        let (monitor, monitoring_rx) = Monitor::from_config(&config.monitoring);

        let topics = handlers.len();
        let fetch_pool = BoundedWorkerPool::new(
            PoolConfig::new(FETCH_POOL, topics, topics).queue_capacity(topics),
            Arc::new(AbortPolicy),
        )?;

        let overflow = Arc::new(OverflowRunner::new(OVERFLOW_RUNNER));
        let process_pool = BoundedWorkerPool::new(
            PoolConfig::new(
                PROCESS_POOL,
                config.core_process_workers,
                config.max_process_workers,
            )
            .keep_alive(config.process_keep_alive)
            .queue_capacity(config.queue_capacity()),
            Arc::new(RunOnOverflow::new(overflow.clone()).with_monitor(monitor.clone())),
        )?;

        let reprocessor = options.reprocessor.unwrap_or_else(|| {
            ErrorReprocessor::builder()
                .concurrency(config.reprocess_concurrency)
                .strategy(Arc::new(RetryStrategy::<ExponentialBackoff>::from_config(
                    config.retry.clone(),
                )))
        });
        let reprocessor = Arc::new(reprocessor.monitor(monitor.clone()).build());

        info!(
            topics = topics,
            fetch_workers = topics,
            core_process_workers = config.core_process_workers,
            max_process_workers = config.max_process_workers,
            process_queue_capacity = config.queue_capacity(),
            "Created topic consumer"
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok((
            Self {
                config,
                connector,
                handlers,
                deserializer,
                fetch_pool,
                process_pool,
                overflow,
                reprocessor,
                state: AtomicU8::new(LifecycleState::Idle as u8),
                state_changed: Notify::new(),
                shutdown_tx,
                monitor,
            },
            monitoring_rx,
        ))
    }

    /// Open one stream per topic and start fetching.
    ///
    /// Fails with [`PipelineError::InvalidState`] unless the consumer is
    /// idle. If the broker cannot provide the streams, or hands out more
    /// streams for a topic than were requested, nothing is launched, the
    /// consumer is left idle and the error is returned.
    pub async fn start(&self) -> Result<()> {
        self.transition(LifecycleState::Idle, LifecycleState::Starting)?;

        match self.launch_fetchers().await {
            Ok(()) => {
                self.set_state(LifecycleState::Running);
                self.monitor
                    .send(PipelineEvent::lifecycle(LifecycleStep::Started));
                info!(topics = self.handlers.len(), "Topic consumer running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start topic consumer");
                self.set_state(LifecycleState::Idle);
                Err(e)
            }
        }
    }

    async fn launch_fetchers(&self) -> Result<()> {
        let topic_counts: HashMap<String, usize> = self
            .handlers
            .keys()
            .map(|topic| (topic.clone(), 1))
            .collect();

        let streams = self
            .connector
            .create_streams(&topic_counts, self.deserializer.clone())
            .await
            .map_err(|e| PipelineError::BrokerError(e.to_string()))?;

        // Every worker holds a fetch slot for its whole life, so the broker
        // must not hand out more streams than there are slots.
        for (topic, topic_streams) in &streams {
            let Some(&requested) = topic_counts.get(topic) else {
                return Err(PipelineError::UnknownTopic(topic.clone()));
            };
            if topic_streams.len() > requested {
                return Err(PipelineError::BrokerError(format!(
                    "broker returned {} streams for topic {}, requested {}",
                    topic_streams.len(),
                    topic,
                    requested
                )));
            }
        }

        let ctx = FetchContext {
            process_pool: self.process_pool.clone(),
            stage_two: StageTwoContext {
                reprocessor: self.reprocessor.clone(),
                monitor: self.monitor.clone(),
                slow_threshold: self.config.slow_process_threshold,
            },
            poll_interval: self.config.backpressure_poll_interval,
            shutdown: self.shutdown_tx.subscribe(),
            monitor: self.monitor.clone(),
        };

        for (topic, topic_streams) in streams {
            info!(topic = %topic, streams = topic_streams.len(), "Assigning streams to fetch workers");
            let Some(handler) = self.handlers.get(&topic) else {
                continue;
            };
            if topic_streams.is_empty() {
                warn!(topic = %topic, "Broker assigned no stream, topic will not be fetched");
            }

            for stream in topic_streams {
                let worker = FetchWorker::new(topic.clone(), stream, handler.clone(), ctx.clone());
                self.fetch_pool.submit(Box::pin(async move {
                    worker.run().await;
                }))?;
            }
        }
        Ok(())
    }

    /// Stop fetching, drain processing, commit offsets and release the broker.
    ///
    /// Does nothing when the consumer is idle or already closing. A close
    /// that arrives while `start` is still opening streams waits for it and
    /// then closes the running consumer. Every step runs once even if an
    /// earlier one failed; the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        loop {
            let changed = self.state_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.compare_exchange(LifecycleState::Running, LifecycleState::Closing) {
                Ok(()) => break,
                Err(LifecycleState::Starting) => {
                    debug!("Close requested while starting, waiting for start to finish");
                    changed.await;
                }
                Err(actual) => {
                    debug!(state = ?actual, "Close requested while not running, ignoring");
                    return Ok(());
                }
            }
        }

        let drain_timeout = self.config.drain_timeout;
        let mut first_error: Option<PipelineError> = None;
        info!(timeout = ?drain_timeout, "Closing topic consumer");

        self.shutdown_tx.send_replace(true);
        let abandoned = self.fetch_pool.shutdown(drain_timeout).await;
        if abandoned > 0 {
            warn!(abandoned = abandoned, "Fetch workers did not stop in time and were aborted");
        }
        self.step_done(LifecycleStep::FetchStopped);

        let abandoned = self.process_pool.shutdown(drain_timeout).await;
        if abandoned > 0 {
            warn!(
                abandoned = abandoned,
                "Stage-2 tasks abandoned, their offsets will be committed unprocessed"
            );
        }
        self.step_done(LifecycleStep::ProcessDrained);

        let abandoned = self.overflow.shutdown(drain_timeout).await;
        if abandoned > 0 {
            warn!(
                abandoned = abandoned,
                "Overflow tasks abandoned, their offsets will be committed unprocessed"
            );
        }
        self.step_done(LifecycleStep::OverflowDrained);

        if let Err(e) = self.connector.commit_offsets().await {
            error!(error = %e, "Failed to commit offsets");
            first_error.get_or_insert(PipelineError::BrokerError(e.to_string()));
        }
        self.step_done(LifecycleStep::OffsetsCommitted);

        if let Err(e) = self.connector.shutdown().await {
            error!(error = %e, "Failed to shut down broker connection");
            first_error.get_or_insert(PipelineError::BrokerError(e.to_string()));
        }
        self.step_done(LifecycleStep::ConnectorClosed);

        self.set_state(LifecycleState::Closed);

        self.reprocessor.close(drain_timeout).await;
        self.step_done(LifecycleStep::ReprocessorClosed);

        info!(
            reprocessed = self.reprocessor.recovered(),
            dropped = self.reprocessor.dropped(),
            "Topic consumer closed"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn connector(&self) -> &B {
        &self.connector
    }

    pub fn process_pool(&self) -> &BoundedWorkerPool {
        &self.process_pool
    }

    pub fn reprocessor(&self) -> &ErrorReprocessor {
        &self.reprocessor
    }

    fn step_done(&self, step: LifecycleStep) {
        debug!(step = ?step, "Close step finished");
        self.monitor.send(PipelineEvent::lifecycle(step));
    }

    fn compare_exchange(
        &self,
        from: LifecycleState,
        to: LifecycleState,
    ) -> std::result::Result<(), LifecycleState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LifecycleState::from_u8)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> Result<()> {
        self.compare_exchange(from, to)
            .map_err(|actual| PipelineError::InvalidState {
                expected: from,
                actual,
            })
    }

    fn set_state(&self, state: LifecycleState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::VALUE_DESERIALIZER;
    use crate::test::mocks::{BrokerCall, MockBroker, MockHandler, MockStream};
    use crate::test::TestUtils;
    use std::time::Duration;

    #[tokio::test]
    async fn test_close_when_idle_is_noop() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;

        consumer.close().await?;

        assert_eq!(consumer.state(), LifecycleState::Idle);
        assert!(broker.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        let (stream, _feed) = MockStream::channel();
        broker.add_stream("orders", stream);
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;

        consumer.start().await?;
        assert!(consumer.is_running());

        let err = consumer.start().await.err();
        assert!(matches!(
            err,
            Some(PipelineError::InvalidState {
                expected: LifecycleState::Idle,
                actual: LifecycleState::Running,
            })
        ));
        assert_eq!(broker.call_count(&BrokerCall::CreateStreams), 1);

        consumer.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_one_stream_requested_per_topic() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new()), ("audit", MockHandler::new())]),
        )?;

        consumer.start().await?;
        let requested = broker.requested().unwrap_or_default();
        assert_eq!(requested.len(), 2);
        assert_eq!(requested.get("orders"), Some(&1));
        assert_eq!(requested.get("audit"), Some(&1));

        consumer.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_broker_failure_leaves_consumer_idle() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        broker.fail_create_streams();
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;

        let err = consumer.start().await.err();
        assert!(matches!(err, Some(PipelineError::BrokerError(_))));
        assert_eq!(consumer.state(), LifecycleState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_for_unknown_topic_is_rejected() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        broker.add_stream("payments", MockStream::from_payloads(["x"]));
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;

        let err = consumer.start().await.err();
        assert!(matches!(err, Some(PipelineError::UnknownTopic(t)) if t == "payments"));
        assert_eq!(consumer.state(), LifecycleState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_extra_stream_for_topic_is_rejected() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        let (open, _feed) = MockStream::channel();
        broker.add_stream("orders", open);
        broker.add_stream("orders", MockStream::from_payloads(["X"]));
        let handler = MockHandler::new();
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", handler.clone())]),
        )?;

        let err = consumer.start().await.err();
        assert!(matches!(err, Some(PipelineError::BrokerError(msg)) if msg.contains("orders")));
        assert_eq!(consumer.state(), LifecycleState::Idle);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handler.p1_seen().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_during_start_waits_and_closes() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        let (stream, _feed) = MockStream::channel();
        broker.add_stream("orders", stream);
        let gate = broker.hold_create_streams();
        let (consumer, _) = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;
        let consumer = Arc::new(consumer);

        let starting = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        TestUtils::wait_until(
            || broker.call_count(&BrokerCall::CreateStreams) == 1,
            Duration::from_secs(1),
        )
        .await?;
        assert_eq!(consumer.state(), LifecycleState::Starting);

        let closing = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.close().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!closing.is_finished());

        gate.notify_one();
        starting.await??;
        closing.await??;

        assert_eq!(consumer.state(), LifecycleState::Closed);
        assert_eq!(
            broker.calls(),
            vec![
                BrokerCall::CreateStreams,
                BrokerCall::CommitOffsets,
                BrokerCall::Shutdown
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_deserializer_fails_construction() {
        let mut config = TestUtils::fast_config(2, 2);
        config
            .properties
            .insert(VALUE_DESERIALIZER.to_string(), "avro".to_string());

        let result = TopicConsumer::new(
            config,
            MockBroker::new(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        );
        assert!(matches!(result, Err(PipelineError::UnknownDeserializer(id)) if id == "avro"));
    }

    #[tokio::test]
    async fn test_empty_handler_map_is_rejected() {
        let result = TopicConsumer::new(
            TestUtils::fast_config(2, 2),
            MockBroker::new(),
            HashMap::new(),
        );
        assert!(matches!(result, Err(PipelineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_commit_failure_still_runs_every_step() -> anyhow::Result<()> {
        let broker = MockBroker::new();
        broker.fail_commit();
        let mut config = TestUtils::fast_config(2, 2);
        config.drain_timeout = Duration::from_millis(200);
        let (consumer, _) = TopicConsumer::new(
            config,
            broker.clone(),
            TestUtils::handlers(&[("orders", MockHandler::new())]),
        )?;

        consumer.start().await?;
        let err = consumer.close().await.err();

        assert!(matches!(err, Some(PipelineError::BrokerError(_))));
        assert_eq!(
            broker.calls(),
            vec![
                BrokerCall::CreateStreams,
                BrokerCall::CommitOffsets,
                BrokerCall::Shutdown
            ]
        );
        assert_eq!(consumer.state(), LifecycleState::Closed);
        assert!(consumer.reprocessor().is_closed());
        Ok(())
    }
}
