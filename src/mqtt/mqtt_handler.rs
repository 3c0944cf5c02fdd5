//! Connection driver for one MQTT client session.
//!
//! [`MqttHandler`] owns the rumqttc event loop and runs it in a tokio task;
//! [`MqttLink`] is the cheap side handed to the rest of the process for
//! publishing, waiting on the connection and disconnecting.
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──► Disconnected ──► Reconnecting ─┐
//!                       │              ▲                │                       │
//!                       ▼              └────────────────┼───────────────────────┘
//!                     Failed ◄──────────────────────────┘ (reconnect disabled)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{MqttConfig, ReconnectPolicy};
use super::error::MqttError;
use super::message_manager::{LinkEvent, MQTTMessage, MsgManager};

const MAX_ERROR_MESSAGES: usize = 10;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

impl MQTTStatus {
    fn push_error(&mut self, message: String) {
        if self.error_messages.len() == MAX_ERROR_MESSAGES {
            self.error_messages.remove(0);
        }
        self.error_messages.push(message);
    }
}

/// Where the relay sends classifications
pub trait ActuatorSink: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError>;

    /// Ends the session. Only the first call has an effect.
    fn disconnect(&self) -> Result<(), MqttError>;
}

pub struct MqttHandler {
    status: watch::Sender<MQTTStatus>,
    client: AsyncClient,
    connection: EventLoop,
    reconnect: ReconnectPolicy,
    subscriptions: Vec<String>,
    qos: QoS,
    msg_manager: MsgManager,
}

impl MqttHandler {
    /// Builds the client for `client_id` without touching the network.
    ///
    /// `subscriptions` are (re)issued on every CONNACK. Incoming publishes and
    /// connection losses go to `events` when given.
    pub fn new(
        config: &MqttConfig,
        client_id: &str,
        subscriptions: Vec<String>,
        events: Option<mpsc::Sender<LinkEvent>>,
    ) -> Result<(Self, MqttLink), MqttError> {
        let (host, port) = config.broker_address()?;
        let qos = config.qos()?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs))
            .set_clean_session(config.clean_session);
        if let Some(user) = &config.user {
            mqtt_options.set_credentials(user.clone(), config.pw.clone().unwrap_or_default());
        }

        let (client, connection) = AsyncClient::new(mqtt_options, config.channel_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(MQTTStatus::default());

        let link = MqttLink {
            client_id: client_id.to_string(),
            client: client.clone(),
            status: status_rx,
            qos,
            disconnected: AtomicBool::new(false),
        };

        let handler = MqttHandler {
            status: status_tx,
            client,
            connection,
            reconnect: config.reconnect.clone(),
            subscriptions,
            qos,
            msg_manager: MsgManager {
                client_id: client_id.to_string(),
                received_msg: events,
            },
        };

        Ok((handler, link))
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Polls the event loop until cancelled, disconnected, or given up.
    pub async fn run(mut self, cancel: CancellationToken) {
        let client_id = self.msg_manager.client_id.clone();
        info!("[{}] Starting MQTT event loop", client_id);
        self.set_state(ConnectionState::Connecting);

        let mut ever_connected = false;
        let mut connected = false;
        let mut attempt: u32 = 0;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Event loop cancelled", client_id);
                    break;
                }
                event = self.connection.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("[{}] Connected to broker: {:?}", client_id, ack.code);
                    ever_connected = true;
                    connected = true;
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    self.subscribe_all();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        "[{}] Received {} bytes on {}",
                        client_id,
                        publish.payload.len(),
                        publish.topic
                    );
                    self.status.send_modify(|s| {
                        s.messages_received += 1;
                        s.last_activity = Some(chrono::Local::now());
                    });
                    let message = MQTTMessage::from_topic(publish.topic, publish.payload.to_vec());
                    if !self.msg_manager.forward(LinkEvent::Message(message)).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    debug!("[{}] Subscription acknowledged: {:?}", client_id, suback.return_codes);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("[{}] Disconnected from broker", client_id);
                    self.set_state(ConnectionState::Disconnected);
                    break;
                }
                Ok(other) => {
                    debug!("[{}] MQTT event: {:?}", client_id, other);
                }
                Err(e) => {
                    let cause = e.to_string();
                    self.status.send_modify(|s| s.push_error(cause.clone()));

                    if !ever_connected {
                        error!("[{}] Connection failed: {}", client_id, cause);
                        self.set_state(ConnectionState::Failed);
                        break;
                    }

                    if connected {
                        connected = false;
                        warn!("[{}] Connection lost: {}", client_id, cause);
                        self.set_state(ConnectionState::Disconnected);
                        let lost = LinkEvent::ConnectionLost {
                            client_id: client_id.clone(),
                            cause: cause.clone(),
                        };
                        if !self.msg_manager.forward(lost).await {
                            break;
                        }
                    } else {
                        debug!("[{}] Reconnect attempt failed: {}", client_id, cause);
                    }

                    if !self.reconnect.enabled {
                        error!("[{}] Reconnect disabled, giving up", client_id);
                        self.set_state(ConnectionState::Failed);
                        break;
                    }

                    let delay = self.reconnect.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                    self.set_state(ConnectionState::Reconnecting);
                    info!("[{}] Reconnecting in {:?}", client_id, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if self.status.borrow().connection_state == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("[{}] MQTT event loop stopped", client_id);
    }

    fn subscribe_all(&self) {
        for topic in &self.subscriptions {
            match self.client.try_subscribe(topic.clone(), self.qos) {
                Ok(()) => info!("[{}] Subscribed to topic: {}", self.msg_manager.client_id, topic),
                Err(e) => error!(
                    "[{}] Failed to subscribe to {}: {}",
                    self.msg_manager.client_id, topic, e
                ),
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.connection_state = state);
    }
}

/// Caller side of a link
pub struct MqttLink {
    client_id: String,
    client: AsyncClient,
    status: watch::Receiver<MQTTStatus>,
    qos: QoS,
    disconnected: AtomicBool,
}

impl MqttLink {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn status(&self) -> MQTTStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connection_state == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Waits for the first CONNACK.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut status = self.status.clone();
        let wait = status.wait_for(|s| {
            matches!(
                s.connection_state,
                ConnectionState::Connected | ConnectionState::Failed
            )
        });

        let state = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => status.connection_state.clone(),
            // sender dropped: the event loop ended without connecting
            Ok(Err(_)) => ConnectionState::Failed,
            Err(_) => {
                return Err(MqttError::ConnectTimeout {
                    client_id: self.client_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        if state == ConnectionState::Connected {
            return Ok(());
        }
        let cause = self
            .status
            .borrow()
            .error_messages
            .last()
            .cloned()
            .unwrap_or_else(|| "event loop stopped".to_string());
        Err(MqttError::ConnectFailed {
            client_id: self.client_id.clone(),
            cause,
        })
    }
}

impl ActuatorSink for MqttLink {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        if !self.is_connected() {
            return Err(MqttError::NotConnected(self.client_id.clone()));
        }
        self.client.try_publish(topic, self.qos, false, payload)?;
        debug!("[{}] Published to {}", self.client_id, topic);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), MqttError> {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            debug!("[{}] Already disconnected", self.client_id);
            return Ok(());
        }
        info!("[{}] Disconnecting", self.client_id);
        self.client.try_disconnect()?;
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if !self.is_disconnected() {
            if let Err(e) = self.disconnect() {
                debug!("[{}] Disconnect on drop failed: {}", self.client_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rumqttc::mqttbytes::{
        self,
        v4::{self, ConnAck, ConnectReturnCode, Publish, SubAck, SubscribeReasonCode},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const MAX_PACKET: usize = 10 * 1024;
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// One client connection on the loopback broker below
    struct BrokerConn {
        socket: TcpStream,
        buf: BytesMut,
    }

    impl BrokerConn {
        /// Accepts a client and answers its CONNECT
        async fn accept(listener: &TcpListener) -> Self {
            let (socket, _) = within(listener.accept()).await.unwrap();
            let mut conn = BrokerConn {
                socket,
                buf: BytesMut::with_capacity(1024),
            };
            match conn.read().await {
                Packet::Connect(..) => {}
                other => panic!("expected CONNECT, got {:?}", other),
            }
            let mut out = BytesMut::new();
            ConnAck::new(ConnectReturnCode::Success, false)
                .write(&mut out)
                .unwrap();
            conn.send(out).await;
            conn
        }

        async fn read(&mut self) -> Packet {
            loop {
                match v4::read(&mut self.buf, MAX_PACKET) {
                    Ok(packet) => return packet,
                    Err(mqttbytes::Error::InsufficientBytes(_)) => {
                        let n = within(self.socket.read_buf(&mut self.buf)).await.unwrap();
                        assert!(n > 0, "client closed the connection");
                    }
                    Err(e) => panic!("malformed packet from client: {:?}", e),
                }
            }
        }

        /// Acks the next SUBSCRIBE and returns its first filter
        async fn ack_subscribe(&mut self) -> String {
            let subscribe = match self.read().await {
                Packet::Subscribe(subscribe) => subscribe,
                other => panic!("expected SUBSCRIBE, got {:?}", other),
            };
            let codes = subscribe
                .filters
                .iter()
                .map(|filter| SubscribeReasonCode::Success(filter.qos))
                .collect();
            let mut out = BytesMut::new();
            SubAck::new(subscribe.pkid, codes).write(&mut out).unwrap();
            self.send(out).await;
            subscribe.filters[0].path.clone()
        }

        async fn publish(&mut self, topic: &str, payload: &[u8]) {
            let mut out = BytesMut::new();
            Publish::new(topic, QoS::AtMostOnce, payload.to_vec())
                .write(&mut out)
                .unwrap();
            self.send(out).await;
        }

        async fn send(&mut self, out: BytesMut) {
            self.socket.write_all(&out).await.unwrap();
        }
    }

    async fn within<F: std::future::Future>(fut: F) -> F::Output {
        tokio::time::timeout(TEST_TIMEOUT, fut)
            .await
            .expect("timed out waiting on the loopback broker")
    }

    fn local_config(listener: &TcpListener, reconnect: bool) -> MqttConfig {
        let port = listener.local_addr().unwrap().port();
        MqttConfig {
            url: format!("tcp://127.0.0.1:{}", port),
            reconnect: ReconnectPolicy {
                enabled: reconnect,
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
            },
            ..MqttConfig::default()
        }
    }

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            // port 1 on loopback refuses connections immediately
            url: "tcp://127.0.0.1:1".to_string(),
            connect_timeout_ms: 5_000,
            ..MqttConfig::default()
        }
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let (_handler, link) =
            MqttHandler::new(&MqttConfig::default(), "actuator", Vec::new(), None).unwrap();
        assert!(!link.is_connected());
        let err = link.publish("m5stick/vibration", b"ALERT".to_vec()).unwrap_err();
        assert!(matches!(err, MqttError::NotConnected(id) if id == "actuator"));
    }

    #[tokio::test]
    async fn disconnect_is_sent_once() {
        let (_handler, link) =
            MqttHandler::new(&MqttConfig::default(), "actuator", Vec::new(), None).unwrap();
        assert!(!link.is_disconnected());
        link.disconnect().unwrap();
        assert!(link.is_disconnected());
        link.disconnect().unwrap();
        assert!(link.is_disconnected());
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let config = MqttConfig {
            qos: 7,
            ..MqttConfig::default()
        };
        assert!(matches!(
            MqttHandler::new(&config, "x", Vec::new(), None),
            Err(MqttError::InvalidQos(7))
        ));
    }

    #[tokio::test]
    async fn initial_connect_failure_is_reported() {
        let (handler, link) =
            MqttHandler::new(&unreachable_config(), "ingest", Vec::new(), None).unwrap();
        let cancel = CancellationToken::new();
        let task = handler.spawn(cancel.clone());

        let err = link.wait_connected(Duration::from_secs(5)).await.unwrap_err();
        assert!(
            matches!(
                err,
                MqttError::ConnectFailed { .. } | MqttError::ConnectTimeout { .. }
            ),
            "{err}"
        );

        cancel.cancel();
        task.await.unwrap();
        assert_ne!(link.status().connection_state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn inbound_publish_and_single_loss_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener, false);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handler, link) = MqttHandler::new(
            &config,
            "ingest",
            vec!["tunnelofen/data".to_string()],
            Some(events_tx),
        )
        .unwrap();
        let task = handler.spawn(CancellationToken::new());

        let mut conn = BrokerConn::accept(&listener).await;
        assert_eq!(conn.ack_subscribe().await, "tunnelofen/data");
        link.wait_connected(TEST_TIMEOUT).await.unwrap();
        assert!(link.is_connected());

        conn.publish("tunnelofen/data", br#"{"currentTemp":85}"#).await;
        match within(events_rx.recv()).await {
            Some(LinkEvent::Message(message)) => {
                assert_eq!(message.topic(), "tunnelofen/data");
                assert_eq!(message.payload(), br#"{"currentTemp":85}"#);
            }
            other => panic!("expected a message, got {:?}", other),
        }

        drop(conn);
        match within(events_rx.recv()).await {
            Some(LinkEvent::ConnectionLost { client_id, cause }) => {
                assert_eq!(client_id, "ingest");
                assert!(!cause.is_empty());
            }
            other => panic!("expected a connection loss, got {:?}", other),
        }

        within(task).await.unwrap();
        assert_eq!(within(events_rx.recv()).await, None);
        let status = link.status();
        assert_eq!(status.connection_state, ConnectionState::Failed);
        assert_eq!(status.messages_received, 1);
        assert!(!status.error_messages.is_empty());
        assert!(status.last_activity.is_some());
    }

    #[tokio::test]
    async fn disconnect_flushes_and_ends_the_loop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener, true);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handler, link) = MqttHandler::new(&config, "actuator", Vec::new(), Some(events_tx))
            .unwrap();
        let task = handler.spawn(CancellationToken::new());

        let mut conn = BrokerConn::accept(&listener).await;
        link.wait_connected(TEST_TIMEOUT).await.unwrap();
        link.publish("m5stick/vibration", b"ALERT".to_vec()).unwrap();
        link.disconnect().unwrap();

        let mut published = Vec::new();
        loop {
            match conn.read().await {
                Packet::Publish(publish) => {
                    published.push((publish.topic.clone(), publish.payload.to_vec()))
                }
                Packet::Disconnect => break,
                Packet::PingReq => {}
                other => panic!("unexpected packet {:?}", other),
            }
        }
        assert_eq!(
            published,
            vec![("m5stick/vibration".to_string(), b"ALERT".to_vec())]
        );

        within(task).await.unwrap();
        assert!(link.is_disconnected());
        assert_eq!(link.status().connection_state, ConnectionState::Disconnected);
        // a requested disconnect is not a connection loss
        assert_eq!(within(events_rx.recv()).await, None);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_after_loss() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = local_config(&listener, true);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (handler, link) = MqttHandler::new(
            &config,
            "ingest",
            vec!["tunnelofen/data".to_string()],
            Some(events_tx),
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let task = handler.spawn(cancel.clone());

        let mut first = BrokerConn::accept(&listener).await;
        assert_eq!(first.ack_subscribe().await, "tunnelofen/data");
        drop(first);
        assert!(matches!(
            within(events_rx.recv()).await,
            Some(LinkEvent::ConnectionLost { .. })
        ));

        let mut second = BrokerConn::accept(&listener).await;
        assert_eq!(second.ack_subscribe().await, "tunnelofen/data");
        assert!(link.is_connected());
        link.wait_connected(TEST_TIMEOUT).await.unwrap();

        cancel.cancel();
        within(task).await.unwrap();
        assert_eq!(link.status().connection_state, ConnectionState::Disconnected);
        assert_eq!(within(events_rx.recv()).await, None);
    }
}
