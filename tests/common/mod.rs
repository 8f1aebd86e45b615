// tests/common/mod.rs
use std::sync::Once;
use std::time::Duration;

use staged_consumer::PipelineConfig;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("staged_consumer=debug".parse().unwrap())
                    .add_directive("integration_tests=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });
}

pub fn create_test_config() -> PipelineConfig {
    let mut config = PipelineConfig {
        max_process_workers: 2,
        process_queue_capacity: Some(2),
        backpressure_poll_interval: Duration::from_millis(20),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    config.retry.initial_backoff = Duration::from_millis(5);
    config.retry.max_backoff = Duration::from_millis(20);
    config.retry.jitter_factor = 0.0;
    config
}
