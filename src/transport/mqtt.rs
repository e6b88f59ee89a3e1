//! MQTT transport publishing samples to the telemetry broker.
//!
//! `connect` spawns a task that drives the rumqttc event loop for the lifetime
//! of the transport. The task tracks the broker session in a
//! [`ConnectionState`] watch channel and keeps polling after a drop, which
//! makes rumqttc reconnect. `publish` only hands the message to the local
//! client queue; it never waits for the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionState, PrimaryTransport, TransportError};
use crate::config::Config;
use crate::sample::Sample;

/// Capacity of the client request channel. A full channel rejects publishes.
const REQUEST_CAPACITY: usize = 64;

/// How long `close` waits for the DISCONNECT packet to go out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl MqttSettings {
    pub fn from_config(config: &Config) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id: format!("{}-{}", config.device_identifier, &suffix[..8]),
            topic_prefix: config.topic_prefix.clone(),
            keep_alive: config.mqtt_keep_alive,
            reconnect_delay: config.mqtt_reconnect_delay,
        }
    }
}

/// Publish/subscribe transport backed by rumqttc.
pub struct MqttTransport {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(settings: MqttSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            settings,
            client: None,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
            event_loop: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(MqttSettings::from_config(config))
    }

    /// Topic a sample for `destination_key` is published to.
    pub fn topic_for(&self, destination_key: &str) -> String {
        format!("{}/{}", self.settings.topic_prefix, destination_key)
    }

    /// Receiver notified on every connection state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }
}

#[async_trait]
impl PrimaryTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.client.is_some() {
            return Ok(());
        }

        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            self.settings.host.clone(),
            self.settings.port,
        );
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        self.shutdown = CancellationToken::new();
        self.state.send_replace(ConnectionState::Connecting);

        info!(
            host = %self.settings.host,
            port = self.settings.port,
            client_id = %self.settings.client_id,
            "Connecting to MQTT broker"
        );

        self.event_loop = Some(tokio::spawn(drive_event_loop(
            eventloop,
            Arc::clone(&self.state),
            self.shutdown.clone(),
            self.settings.reconnect_delay,
        )));
        self.client = Some(client);

        Ok(())
    }

    async fn publish(&self, destination_key: &str, sample: &Sample) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;

        let state = *self.state.borrow();
        if state != ConnectionState::Connected {
            return Err(TransportError::NotConnected(state));
        }

        let topic = self.topic_for(destination_key);
        let payload = sample.to_json()?;

        client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        debug!(topic = %topic, "Published sample");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "MQTT disconnect request not queued");
            }
        }

        if let Some(mut handle) = self.event_loop.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await.is_err() {
                self.shutdown.cancel();
                let _ = handle.await;
            }
            info!("MQTT transport closed");
        }

        self.shutdown.cancel();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Poll the event loop until cancelled or a DISCONNECT has been sent.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    state: Arc<watch::Sender<ConnectionState>>,
    shutdown: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    info!("Connected to MQTT broker");
                    state.send_replace(ConnectionState::Connected);
                } else {
                    warn!(code = ?ack.code, "MQTT broker refused connection");
                    state.send_replace(ConnectionState::Disconnected);
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT broker closed the session");
                state.send_replace(ConnectionState::Disconnected);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if *state.borrow() == ConnectionState::Connected {
                    warn!(error = %e, "Disconnected from MQTT broker");
                } else {
                    debug!(error = %e, "MQTT connection attempt failed");
                }
                state.send_replace(ConnectionState::Disconnected);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                state.send_replace(ConnectionState::Connecting);
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn settings(port: u16) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            client_id: "test-client".to_string(),
            topic_prefix: "zerocraftr/telemetry".to_string(),
            keep_alive: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(50),
        }
    }

    fn sample() -> Sample {
        Sample::new(
            "dev-1",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            "power",
            1200.0,
            "W",
        )
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, wanted: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state change timed out")
            .expect("state channel closed");
    }

    #[test]
    fn test_topic_uses_prefix_and_key() {
        let transport = MqttTransport::new(settings(1883));
        assert_eq!(transport.topic_for("dev-1"), "zerocraftr/telemetry/dev-1");
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config::default();
        let settings = MqttSettings::from_config(&config);

        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.topic_prefix, "zerocraftr/telemetry");
        assert!(settings.client_id.starts_with("edge-device-001-"));
    }

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let transport = MqttTransport::new(settings(1883));

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.publish("dev-1", &sample()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_publish_while_broker_unreachable_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = MqttTransport::new(settings(port));
        transport.connect().await.unwrap();

        let result = transport.publish("dev-1", &sample()).await;
        assert!(matches!(result, Err(TransportError::NotConnected(_))));

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_reaches_broker_once_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            // CONNECT
            socket.read(&mut buf).await.unwrap();
            // CONNACK, session not present, accepted
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&received).contains("\"unit\":\"W\"") {
                    break;
                }
            }
            String::from_utf8_lossy(&received).into_owned()
        });

        let mut transport = MqttTransport::new(settings(port));
        let mut state = transport.subscribe_state();
        transport.connect().await.unwrap();
        wait_for(&mut state, ConnectionState::Connected).await;

        transport.publish("dev-1", &sample()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert!(received.contains("zerocraftr/telemetry/dev-1"));
        assert!(received.contains("\"metric\":\"power\""));

        transport.close().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_broker_drops_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (drop_tx, drop_rx) = tokio::sync::oneshot::channel::<()>();

        let broker = tokio::spawn(async move {
            let mut buf = [0u8; 512];

            // first session: accept, then drop the socket on request
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
            drop_rx.await.unwrap();
            drop(socket);

            // second session: accept and collect until the sample arrives
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.read(&mut buf).await.unwrap();
            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&received).contains("\"unit\":\"W\"") {
                    break;
                }
            }
            String::from_utf8_lossy(&received).into_owned()
        });

        let mut settings = settings(port);
        // long enough that the outage is observable before the retry
        settings.reconnect_delay = Duration::from_millis(300);
        let mut transport = MqttTransport::new(settings);
        let mut state = transport.subscribe_state();

        transport.connect().await.unwrap();
        wait_for(&mut state, ConnectionState::Connected).await;

        drop_tx.send(()).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await
        .expect("session drop not noticed")
        .unwrap();
        assert!(matches!(
            transport.publish("dev-1", &sample()).await,
            Err(TransportError::NotConnected(_))
        ));

        wait_for(&mut state, ConnectionState::Connected).await;
        transport.publish("dev-1", &sample()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert!(received.contains("zerocraftr/telemetry/dev-1"));

        transport.close().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = MqttTransport::new(settings(1));
        transport.connect().await.unwrap();

        transport.close().await;
        transport.close().await;

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(
            transport.publish("dev-1", &sample()).await,
            Err(TransportError::Closed)
        ));
    }
}
