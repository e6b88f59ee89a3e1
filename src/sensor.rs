//! Sample collection.
//!
//! The coordinator pulls measurements through [`SampleCollector`]. Real sensor
//! drivers implement the trait; [`SimulatedSensor`] produces random readings for
//! development and bench deployments.

use std::ops::Range;

use chrono::Utc;
use rand::Rng;
use tracing::debug;

use crate::sample::Sample;

/// Source of fresh samples, polled once per delivery cycle.
pub trait SampleCollector: Send {
    fn collect(&mut self) -> Sample;
}

/// Shape of the readings produced by a [`SimulatedSensor`].
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Metric name carried in each sample
    pub metric: String,

    /// Unit of measure carried in each sample
    pub unit: String,

    /// Range readings are drawn from (uniform)
    pub range: Range<f64>,
}

impl Default for SensorConfig {
    /// Active power draw of a machine on the factory floor.
    fn default() -> Self {
        Self {
            metric: "power".to_string(),
            unit: "W".to_string(),
            range: 800.0..1600.0,
        }
    }
}

/// Random-reading stand-in for a real sensor integration.
pub struct SimulatedSensor {
    device_identifier: String,
    config: SensorConfig,
}

impl SimulatedSensor {
    pub fn new(device_identifier: impl Into<String>, config: SensorConfig) -> Self {
        Self {
            device_identifier: device_identifier.into(),
            config,
        }
    }

    /// Create a simulated power meter for the given device.
    pub fn with_defaults(device_identifier: impl Into<String>) -> Self {
        Self::new(device_identifier, SensorConfig::default())
    }

    fn read_value(&self, rng: &mut impl Rng) -> f64 {
        let raw = rng.gen_range(self.config.range.clone());
        (raw * 100.0).round() / 100.0
    }
}

impl SampleCollector for SimulatedSensor {
    fn collect(&mut self) -> Sample {
        let mut rng = rand::thread_rng();
        let sample = Sample::new(
            self.device_identifier.clone(),
            Utc::now(),
            self.config.metric.clone(),
            self.read_value(&mut rng),
            self.config.unit.clone(),
        );
        debug!(?sample, "Collected sample");
        sample
    }
}
