//! ZeroCraftr Edge Agent Library
//!
//! Store-and-forward telemetry delivery for edge devices:
//!
//! - **sample**: the measurement model and its JSON wire form
//! - **sensor**: collection interface and a simulated power meter
//! - **queue**: SQLite-backed durable FIFO for undelivered samples
//! - **transport**: MQTT (primary) and HTTP (secondary) delivery channels
//! - **coordinator**: the collect → deliver → buffer → flush run loop
//! - **config**: YAML file + environment configuration
//! - **shutdown**: signal handlers feeding the cancellation token
//!
//! # Example
//!
//! ```no_run
//! use edge_agent::config::Config;
//! use edge_agent::coordinator::DeliveryCoordinator;
//! use edge_agent::queue::PersistentQueue;
//! use edge_agent::sensor::SimulatedSensor;
//! use edge_agent::transport::{HttpTransport, MqttTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let queue = PersistentQueue::open(&config.buffer_path)?;
//!
//!     let mut coordinator = DeliveryCoordinator::new(
//!         SimulatedSensor::with_defaults(config.device_identifier.clone()),
//!         MqttTransport::from_config(&config),
//!         HttpTransport::new(&config)?,
//!         queue,
//!         config.poll_interval,
//!     );
//!
//!     coordinator.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod queue;
pub mod sample;
pub mod sensor;
pub mod shutdown;
pub mod transport;

pub use config::{Config, ConfigError};
pub use coordinator::{AgentState, DeliveryCoordinator, DeliveryOutcome, DeliveryStats};
pub use queue::{PersistentQueue, QueueError};
pub use sample::Sample;
pub use sensor::{SampleCollector, SensorConfig, SimulatedSensor};
pub use transport::{
    ConnectionState, HttpTransport, MqttTransport, PrimaryTransport, SecondaryTransport,
    TransportError,
};
