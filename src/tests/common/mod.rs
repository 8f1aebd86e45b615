use std::sync::Once;

use tokio::sync::mpsc;

use crate::monitoring::{LifecycleStep, PipelineEvent, PipelineEventType};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("staged_consumer=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

/// Everything currently buffered on the monitoring channel
pub fn drain_events(rx: &mut mpsc::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn lifecycle_steps(events: &[PipelineEvent]) -> Vec<LifecycleStep> {
    events
        .iter()
        .filter_map(|event| match event.event_type {
            PipelineEventType::Lifecycle(step) => Some(step),
            _ => None,
        })
        .collect()
}
