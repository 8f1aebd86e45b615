use super::types::{FetchExit, PipelineEvent, PipelineEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Aggregated metrics for a single topic
#[derive(Debug, Clone)]
pub struct TopicMetrics {
    pub messages_processed: u64,
    pub stage1_failures: u64,
    pub stage2_failures: u64,
    pub resolved_by_handler: u64,
    pub reprocessed: u64,
    pub reprocess_dropped: u64,
    pub processing_time: Duration,
    pub avg_processing_time: Duration,
    pub max_processing_time: Duration,
    pub fetch_stream_errors: u64,
    pub last_updated: Instant,
}

impl Default for TopicMetrics {
    fn default() -> Self {
        Self {
            messages_processed: 0,
            stage1_failures: 0,
            stage2_failures: 0,
            resolved_by_handler: 0,
            reprocessed: 0,
            reprocess_dropped: 0,
            processing_time: Duration::default(),
            avg_processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            fetch_stream_errors: 0,
            last_updated: Instant::now(),
        }
    }
}

/// Aggregates monitoring events into per-topic metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, TopicMetrics>>>,
    overflowed: Arc<RwLock<HashMap<String, u64>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<PipelineEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<PipelineEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            overflowed: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Consume events and log metrics every window until the channel closes
    pub async fn run(mut self) {
        let mut ticker = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, metrics aggregator exiting");
                        return;
                    }
                },
                _ = ticker.tick() => self.emit_metrics().await,
            }
        }
    }

    pub async fn process_event(&self, event: PipelineEvent) {
        let topic = match (&event.event_type, event.topic) {
            (PipelineEventType::Overflowed { pool }, _) => {
                *self.overflowed.write().await.entry(pool.clone()).or_insert(0) += 1;
                return;
            }
            (_, Some(topic)) => topic,
            (_, None) => return,
        };

        let mut metrics = self.metrics.write().await;
        let topic_metrics = metrics.entry(topic.clone()).or_default();

        match event.event_type {
            PipelineEventType::Stage2Complete { duration } => {
                topic_metrics.messages_processed += 1;
                topic_metrics.processing_time += duration;
                let count = u32::try_from(topic_metrics.messages_processed).unwrap_or(u32::MAX);
                topic_metrics.avg_processing_time = topic_metrics.processing_time / count;
                if duration > topic_metrics.max_processing_time {
                    topic_metrics.max_processing_time = duration;
                }
            }
            PipelineEventType::Stage1Failure { error } => {
                topic_metrics.stage1_failures += 1;
                trace!(topic = %topic, error = %error, "Stage-1 failure recorded");
            }
            PipelineEventType::Stage2Failure { error, resolved } => {
                topic_metrics.stage2_failures += 1;
                if resolved {
                    topic_metrics.resolved_by_handler += 1;
                }
                trace!(topic = %topic, error = %error, resolved = resolved, "Stage-2 failure recorded");
            }
            PipelineEventType::Reprocessed { .. } => {
                topic_metrics.reprocessed += 1;
            }
            PipelineEventType::ReprocessDropped { .. } => {
                topic_metrics.reprocess_dropped += 1;
            }
            PipelineEventType::FetchStopped { reason } => {
                if reason == FetchExit::StreamError {
                    topic_metrics.fetch_stream_errors += 1;
                }
            }
            PipelineEventType::FetchStarted
            | PipelineEventType::Overflowed { .. }
            | PipelineEventType::Lifecycle(_) => {}
        }

        topic_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (topic, metrics) in metrics.iter() {
            info!(
                topic = %topic,
                messages_processed = metrics.messages_processed,
                stage1_failures = metrics.stage1_failures,
                stage2_failures = metrics.stage2_failures,
                resolved_by_handler = metrics.resolved_by_handler,
                reprocessed = metrics.reprocessed,
                reprocess_dropped = metrics.reprocess_dropped,
                avg_processing_time_ms = %metrics.avg_processing_time.as_millis(),
                max_processing_time_ms = %metrics.max_processing_time.as_millis(),
                "Metrics for window"
            );

            if metrics.reprocess_dropped > 0 {
                warn!(
                    topic = %topic,
                    dropped = metrics.reprocess_dropped,
                    "Messages dropped after reprocessing"
                );
            }
        }

        for (pool, count) in self.overflowed.read().await.iter() {
            if *count > 0 {
                warn!(pool = %pool, overflowed = count, "Tasks ran on the overflow runner");
            }
        }
    }

    /// Current metrics for all topics
    pub async fn get_metrics(&self) -> HashMap<String, TopicMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_topic_metrics(&self, topic: &str) -> Option<TopicMetrics> {
        self.metrics.read().await.get(topic).cloned()
    }

    /// Tasks sent to the overflow runner, per pool
    pub async fn overflow_count(&self, pool: &str) -> u64 {
        self.overflowed.read().await.get(pool).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> MetricsAggregator {
        let (_tx, rx) = mpsc::channel(1);
        MetricsAggregator::new(Duration::from_secs(60), rx)
    }

    #[tokio::test]
    async fn test_stage_events_fold_into_topic_metrics() {
        let aggregator = aggregator();

        aggregator
            .process_event(PipelineEvent::stage2_complete("orders", Duration::from_millis(10)))
            .await;
        aggregator
            .process_event(PipelineEvent::stage2_complete("orders", Duration::from_millis(30)))
            .await;
        aggregator
            .process_event(PipelineEvent::stage2_failure("orders", "boom".into(), false))
            .await;
        aggregator
            .process_event(PipelineEvent::stage2_failure("orders", "meh".into(), true))
            .await;
        aggregator
            .process_event(PipelineEvent::stage1_failure("audit", "bad".into()))
            .await;

        let orders = aggregator.get_topic_metrics("orders").await.unwrap();
        assert_eq!(orders.messages_processed, 2);
        assert_eq!(orders.stage2_failures, 2);
        assert_eq!(orders.resolved_by_handler, 1);
        assert_eq!(orders.avg_processing_time, Duration::from_millis(20));
        assert_eq!(orders.max_processing_time, Duration::from_millis(30));

        let audit = aggregator.get_topic_metrics("audit").await.unwrap();
        assert_eq!(audit.stage1_failures, 1);
        assert_eq!(audit.messages_processed, 0);
    }

    #[tokio::test]
    async fn test_overflow_counted_per_pool() {
        let aggregator = aggregator();

        aggregator.process_event(PipelineEvent::overflowed("processor")).await;
        aggregator.process_event(PipelineEvent::overflowed("processor")).await;

        assert_eq!(aggregator.overflow_count("processor").await, 2);
        assert_eq!(aggregator.overflow_count("fetcher").await, 0);
        assert!(aggregator.get_metrics().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_exits_when_channel_closes() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel(8);
        let aggregator = MetricsAggregator::new(Duration::from_millis(20), rx);

        tx.send(PipelineEvent::reprocessed("orders", 2)).await?;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), aggregator.run()).await?;
        Ok(())
    }
}
