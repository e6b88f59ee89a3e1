//! Telemetry sample model.
//!
//! A [`Sample`] is one measurement ready for transmission. Its JSON form is the
//! wire contract shared by the MQTT topic, the HTTP ingestion endpoint and the
//! local queue payload column.

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Wire format for sample timestamps: ISO-8601, second precision, `Z` suffix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A single measurement. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    device_identifier: String,

    #[serde(with = "timestamp_format")]
    timestamp: DateTime<Utc>,

    metric: String,

    #[serde(serialize_with = "finite_value")]
    value: f64,

    unit: String,
}

impl Sample {
    /// Create a sample. Sub-second precision on `timestamp` is discarded.
    pub fn new(
        device_identifier: impl Into<String>,
        timestamp: DateTime<Utc>,
        metric: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            device_identifier: device_identifier.into(),
            timestamp: timestamp.trunc_subsecs(0),
            metric: metric.into(),
            value,
            unit: unit.into(),
        }
    }

    pub fn device_identifier(&self) -> &str {
        &self.device_identifier
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Serialize to the JSON wire form.
    ///
    /// # Errors
    ///
    /// Fails when `value` is NaN or infinite; JSON cannot carry either.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the JSON wire form.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

fn finite_value<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if !value.is_finite() {
        return Err(serde::ser::Error::custom(format!(
            "sample value {value} is not a finite number"
        )));
    }
    serializer.serialize_f64(*value)
}

mod timestamp_format {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&timestamp.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, TIMESTAMP_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
