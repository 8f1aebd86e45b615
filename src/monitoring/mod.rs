//! Monitoring system for tracking consumer health
//!
//! Components publish [`PipelineEvent`]s on an optional channel; the
//! [`MetricsAggregator`] folds them into per-topic counters.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, TopicMetrics};
pub use types::{FetchExit, LifecycleStep, MonitoringConfig, PipelineEvent, PipelineEventType};

use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Non-blocking handle for publishing monitoring events
#[derive(Debug, Clone, Default)]
pub(crate) struct Monitor {
    tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Monitor {
    pub(crate) fn new(tx: Option<mpsc::Sender<PipelineEvent>>) -> Self {
        Self { tx }
    }

    /// Build a monitor and its receiver according to `config`
    pub(crate) fn from_config(
        config: &MonitoringConfig,
    ) -> (Self, Option<mpsc::Receiver<PipelineEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            (Self::new(Some(tx)), Some(rx))
        } else {
            (Self::default(), None)
        }
    }

    /// Send without waiting; a full or closed channel drops the event
    pub(crate) fn send(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            match tx.try_send(event) {
                Ok(()) => trace!("Sent monitoring event"),
                Err(e) => warn!(error = %e, "Failed to send monitoring event"),
            }
        }
    }
}
