//! ZeroCraftr Edge Agent - store-and-forward telemetry delivery
//!
//! Collects a sample every poll interval and sends it over MQTT and HTTP.
//! Anything either transport fails to take is written to a local SQLite
//! buffer and retried on the next cycle.
//!
//! ## Configuration
//!
//! - `EDGE_AGENT_CONFIG`: path to a YAML config file (optional)
//! - `EDGE_AGENT_DEVICE_ID`, `EDGE_AGENT_FACTORY_ID`
//! - `EDGE_AGENT_BACKEND_URL`: backend base URL (default: http://localhost:8000)
//! - `EDGE_AGENT_MQTT_HOST`, `EDGE_AGENT_MQTT_PORT`, `EDGE_AGENT_TOPIC_PREFIX`
//! - `EDGE_AGENT_MQTT_KEEP_ALIVE_SECS`, `EDGE_AGENT_MQTT_RECONNECT_DELAY_SECS` (minimum: 1)
//! - `EDGE_AGENT_POLL_INTERVAL_SECS`: seconds between samples (default: 10)
//! - `EDGE_AGENT_BUFFER_PATH`, `EDGE_AGENT_BUFFER_MAX_ENTRIES`
//! - `RUST_LOG`: logging level filter (default: info)

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edge_agent::config::Config;
use edge_agent::coordinator::DeliveryCoordinator;
use edge_agent::queue::PersistentQueue;
use edge_agent::sensor::SimulatedSensor;
use edge_agent::shutdown::spawn_signal_handlers;
use edge_agent::transport::{HttpTransport, MqttTransport};

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting ZeroCraftr edge agent");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                device = %config.device_identifier,
                factory_id = config.factory_id,
                backend = %config.backend_url,
                broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
                poll_interval_secs = config.poll_interval.as_secs(),
                buffer = %config.buffer_path.display(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let queue = match PersistentQueue::open(&config.buffer_path) {
        Ok(queue) => queue.with_max_entries(config.buffer_max_entries),
        Err(e) => {
            error!(error = %e, "Failed to open telemetry buffer");
            std::process::exit(1);
        }
    };

    let http = match HttpTransport::new(&config) {
        Ok(http) => http,
        Err(e) => {
            error!(error = %e, "Failed to create HTTP client");
            std::process::exit(1);
        }
    };

    let mut coordinator = DeliveryCoordinator::new(
        SimulatedSensor::with_defaults(config.device_identifier.clone()),
        MqttTransport::from_config(&config),
        http,
        queue,
        config.poll_interval,
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(shutdown.clone());

    if let Err(e) = coordinator.run(shutdown).await {
        error!(error = %e, "Telemetry buffer failure, stopping agent");
        std::process::exit(1);
    }

    let stats = coordinator.stats();
    info!(
        collected = stats.samples_collected,
        buffered = stats.samples_buffered,
        flushed = stats.samples_flushed,
        rejected = stats.samples_rejected,
        "Edge agent stopped"
    );
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
