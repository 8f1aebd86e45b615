use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Configuration for the monitoring system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A monitoring event from the consumer
#[derive(Debug, Clone)]
pub struct PipelineEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Topic the event relates to, if any
    pub topic: Option<String>,
    pub event_type: PipelineEventType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEventType {
    FetchStarted,
    FetchStopped {
        reason: FetchExit,
    },
    Stage1Failure {
        error: String,
    },
    Stage2Complete {
        duration: Duration,
    },
    Stage2Failure {
        error: String,
        /// Whether the handler's error hook resolved it
        resolved: bool,
    },
    /// A task was handed to the overflow runner
    Overflowed {
        pool: String,
    },
    Reprocessed {
        attempts: u32,
    },
    ReprocessDropped {
        attempts: u32,
        reason: String,
    },
    Lifecycle(LifecycleStep),
}

/// Why a fetch task left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchExit {
    /// The stream reported no further messages
    EndOfStream,
    /// Shutdown was signalled
    Interrupted,
    /// The stream returned an error
    StreamError,
}

/// Steps of `TopicConsumer::close`, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    Started,
    FetchStopped,
    ProcessDrained,
    OverflowDrained,
    OffsetsCommitted,
    ConnectorClosed,
    ReprocessorClosed,
}

impl PipelineEvent {
    fn new(topic: Option<String>, event_type: PipelineEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            topic,
            event_type,
        }
    }

    pub fn fetch_started(topic: &str) -> Self {
        Self::new(Some(topic.to_string()), PipelineEventType::FetchStarted)
    }

    pub fn fetch_stopped(topic: &str, reason: FetchExit) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::FetchStopped { reason },
        )
    }

    pub fn stage1_failure(topic: &str, error: String) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::Stage1Failure { error },
        )
    }

    pub fn stage2_complete(topic: &str, duration: Duration) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::Stage2Complete { duration },
        )
    }

    pub fn stage2_failure(topic: &str, error: String, resolved: bool) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::Stage2Failure { error, resolved },
        )
    }

    pub fn overflowed(pool: &str) -> Self {
        Self::new(
            None,
            PipelineEventType::Overflowed {
                pool: pool.to_string(),
            },
        )
    }

    pub fn reprocessed(topic: &str, attempts: u32) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::Reprocessed { attempts },
        )
    }

    pub fn reprocess_dropped(topic: &str, attempts: u32, reason: String) -> Self {
        Self::new(
            Some(topic.to_string()),
            PipelineEventType::ReprocessDropped { attempts, reason },
        )
    }

    pub fn lifecycle(step: LifecycleStep) -> Self {
        Self::new(None, PipelineEventType::Lifecycle(step))
    }
}
