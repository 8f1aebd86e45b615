//! Test utilities and mock implementations for the staged consumer


use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::handler::MessageHandler;
use crate::retry::RetryConfig;

/// Helper functions for building test fixtures
pub struct TestUtils;

impl TestUtils {
    /// Handler map from `(topic, handler)` pairs
    pub fn handlers<H>(pairs: &[(&str, H)]) -> HashMap<String, Arc<dyn MessageHandler>>
    where
        H: MessageHandler + Clone + 'static,
    {
        pairs
            .iter()
            .map(|(topic, handler)| {
                let handler: Arc<dyn MessageHandler> = Arc::new(handler.clone());
                (topic.to_string(), handler)
            })
            .collect()
    }

    /// Config with short timings suitable for tests
    pub fn fast_config(max_process_workers: usize, queue_capacity: usize) -> PipelineConfig {
        PipelineConfig {
            max_process_workers,
            core_process_workers: 1,
            process_queue_capacity: Some(queue_capacity),
            process_keep_alive: Duration::from_millis(100),
            backpressure_poll_interval: Duration::from_millis(20),
            drain_timeout: Duration::from_secs(2),
            retry: RetryConfig {
                max_retries: Some(3),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                jitter_factor: 0.0,
            },
            ..Default::default()
        }
    }

    /// Poll `check` until it holds or `timeout` elapses
    pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> anyhow::Result<()> {
        let start = Instant::now();
        while !check() {
            if start.elapsed() > timeout {
                anyhow::bail!("Condition not met within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }
}
