//! Delivery transports.
//!
//! Two independent channels carry the same payload: a publish/subscribe broker
//! ([`PrimaryTransport`], MQTT) and a request/response endpoint
//! ([`SecondaryTransport`], HTTP). Neither retries internally; failures surface
//! as [`TransportError`] and the coordinator buffers the sample instead.

pub mod http;
pub mod mqtt;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::sample::Sample;

pub use http::HttpTransport;
pub use mqtt::MqttTransport;

/// Connection state of the primary transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Errors produced by a single delivery attempt. All are transient from the
/// coordinator's point of view.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Broker connection is not established
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// The local client refused to accept the message
    #[error("message rejected: {0}")]
    Rejected(String),

    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Endpoint answered with a non-success status
    #[error("server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// Request did not complete within the configured timeout
    #[error("request timed out")]
    Timeout,

    /// Sample could not be encoded
    #[error("failed to encode sample: {0}")]
    Encode(#[from] serde_json::Error),

    /// Transport has been closed
    #[error("transport closed")]
    Closed,

    /// Client could not be constructed
    #[error("transport configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// Best-effort publish/subscribe channel.
#[async_trait]
pub trait PrimaryTransport: Send + Sync {
    /// Start the connection and its background reconnect mechanism.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Hand `sample` to the local client for the channel derived from
    /// `destination_key`. Success means accepted for transmission, not
    /// confirmed delivered.
    async fn publish(&self, destination_key: &str, sample: &Sample) -> Result<(), TransportError>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Release the connection. Idempotent.
    async fn close(&mut self);
}

/// Synchronous, confirmable request/response channel.
#[async_trait]
pub trait SecondaryTransport: Send + Sync {
    /// Deliver `sample` with a single bounded request.
    async fn send(&self, sample: &Sample) -> Result<(), TransportError>;

    /// Release pooled connections. Idempotent.
    async fn close(&mut self);
}
