//! # Publish Sinks
//!
//! A [`PublishSink`] delivers a rendered topic and payload to the broker. The
//! dispatcher only ever sees the trait object, so the HTTP surface can run against
//! the real [`MqttSink`] or the recording [`InMemorySink`].
//!
//! The broker connection is one shared resource. `rumqttc` serializes requests
//! from every clone of its client through a single event loop, which this module
//! drives on a background task. QoS 0 publishes are fire-and-forget; QoS 1 and 2
//! publishes complete only when the broker acknowledges them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::{BrokerConfig, Qos};

/// Delay between reconnect attempts after the event loop reports an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the request channel between clients and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Errors that can occur while publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The sink has no live broker connection, or lost it before the broker
    /// acknowledged the message.
    NotConnected,
    /// The broker did not acknowledge the message in time.
    AckTimeout,
    /// The client or broker refused the publish.
    Rejected(String),
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "MQTT client not connected"),
            Self::AckTimeout => write!(f, "timed out waiting for broker acknowledgement"),
            Self::Rejected(msg) => write!(f, "Publish rejected: {}", msg),
        }
    }
}

impl std::error::Error for PublishError {}

/// Anything that can deliver a message to the broker.
///
/// Implementations must tolerate concurrent `publish` calls from many requests.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Publish `payload` to `topic`.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError>;

    /// Whether the sink currently has a live broker connection.
    fn is_connected(&self) -> bool;
}

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

type AckSender = oneshot::Sender<Result<(), PublishError>>;

/// Publishes waiting on the broker.
#[derive(Debug, Default)]
struct PendingAcks {
    /// One entry per publish handed to the client whose packet id is not known
    /// yet, in the order the event loop sends them; `None` for QoS 0.
    queued: VecDeque<Option<AckSender>>,
    /// QoS 1 and 2 publishes awaiting PUBACK or PUBCOMP, by packet id.
    inflight: HashMap<u16, AckSender>,
}

impl PendingAcks {
    /// The event loop wrote the oldest queued publish under `pkid`.
    fn sent(&mut self, pkid: u16) {
        if let Some(Some(sender)) = self.queued.pop_front() {
            self.inflight.insert(pkid, sender);
        }
    }

    fn acknowledged(&mut self, pkid: u16) {
        if let Some(sender) = self.inflight.remove(&pkid) {
            let _ = sender.send(Ok(()));
        }
    }

    /// The connection is gone; nothing waiting will be acknowledged.
    fn fail_all(&mut self) {
        let queued = self.queued.drain(..).flatten();
        let inflight = self.inflight.drain().map(|(_, sender)| sender);
        for sender in queued.chain(inflight) {
            let _ = sender.send(Err(PublishError::NotConnected));
        }
    }
}

fn with_acks<T>(acks: &Mutex<PendingAcks>, f: impl FnOnce(&mut PendingAcks) -> T) -> Option<T> {
    acks.lock().ok().map(|mut acks| f(&mut acks))
}

/// A sink backed by a `rumqttc` client.
pub struct MqttSink {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    acks: Arc<Mutex<PendingAcks>>,
    /// Held while queueing an acknowledgement slot and handing its request to
    /// the client, so slots and requests share one order.
    order: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    event_loop: JoinHandle<()>,
}

impl MqttSink {
    /// Create the client and spawn its event loop.
    ///
    /// Returns immediately; the connection is established in the background and
    /// re-established after failures. Must be called from within a tokio runtime.
    pub fn connect(config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive));
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.as_deref().unwrap_or_default());
        }

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(Mutex::new(PendingAcks::default()));

        let broker = format!("{}:{}", config.broker, config.port);
        let loop_connected = Arc::clone(&connected);
        let loop_stopping = Arc::clone(&stopping);
        let loop_acks = Arc::clone(&acks);
        let event_loop = tokio::spawn(async move {
            let lost = |reason: &str| {
                loop_connected.store(false, Ordering::SeqCst);
                with_acks(&loop_acks, PendingAcks::fail_all);
                tracing::debug!(
                    broker = %broker,
                    reason,
                    "failed publishes awaiting acknowledgement"
                );
            };
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            tracing::info!(broker = %broker, "connected to MQTT broker");
                            loop_connected.store(true, Ordering::SeqCst);
                        } else {
                            tracing::error!(
                                broker = %broker,
                                code = ?ack.code,
                                "MQTT broker refused connection"
                            );
                            lost("connection refused");
                        }
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        with_acks(&loop_acks, |acks| acks.sent(pkid));
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        with_acks(&loop_acks, |acks| acks.acknowledged(ack.pkid));
                    }
                    Ok(Event::Incoming(Packet::PubComp(comp))) => {
                        with_acks(&loop_acks, |acks| acks.acknowledged(comp.pkid));
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        tracing::warn!(broker = %broker, "MQTT broker closed the connection");
                        lost("broker disconnect");
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        lost("client disconnect");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        lost("connection error");
                        if loop_stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::error!(
                            broker = %broker,
                            error = %e,
                            "MQTT connection error; retrying"
                        );
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
            tracing::debug!(broker = %broker, "MQTT event loop stopped");
        });

        Self {
            client,
            connected,
            stopping,
            acks,
            order: tokio::sync::Mutex::new(()),
            ack_timeout: Duration::from_secs(config.ack_timeout),
            event_loop,
        }
    }

    /// Wait up to `timeout` for the first successful connection.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_connected() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Disconnect from the broker and stop the event loop.
    pub async fn disconnect(&self) {
        tracing::debug!("disconnecting from MQTT broker");
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            tracing::warn!(error = %e, "MQTT disconnect request failed");
            self.event_loop.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PublishSink for MqttSink {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            tracing::error!(topic, "attempted to publish without connected MQTT client");
            return Err(PublishError::NotConnected);
        }

        let qos = QoS::from(qos);
        let (sender, receiver) = oneshot::channel();
        {
            let _order = self.order.lock().await;
            let slot = (qos != QoS::AtMostOnce).then_some(sender);
            with_acks(&self.acks, |acks| acks.queued.push_back(slot));
            if let Err(e) = self
                .client
                .publish(topic, qos, retain, payload.to_vec())
                .await
            {
                with_acks(&self.acks, |acks| {
                    acks.queued.pop_back();
                });
                return Err(PublishError::Rejected(e.to_string()));
            }
        }
        if qos == QoS::AtMostOnce {
            return Ok(());
        }

        match tokio::time::timeout(self.ack_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PublishError::NotConnected),
            Err(_) => {
                tracing::warn!(topic, "timed out waiting for broker acknowledgement");
                Err(PublishError::AckTimeout)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttSink {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// A message captured by [`InMemorySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPublish {
    /// The rendered topic.
    pub topic: String,
    /// The payload bytes.
    pub payload: Vec<u8>,
    /// Requested delivery guarantee.
    pub qos: Qos,
    /// Whether the broker should retain the message.
    pub retain: bool,
}

/// A sink that records publishes in memory.
///
/// Starts connected. Useful for tests and for dry runs without a broker.
#[derive(Debug)]
pub struct InMemorySink {
    published: Mutex<Vec<RecordedPublish>>,
    connected: AtomicBool,
    failure: Mutex<Option<PublishError>>,
}

impl InMemorySink {
    /// Create a connected sink with nothing recorded.
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            failure: Mutex::new(None),
        }
    }

    /// Mark the sink connected or disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every subsequent publish fail with `failure`, or succeed again with `None`.
    pub fn fail_with(&self, failure: Option<PublishError>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = failure;
        }
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublishSink for InMemorySink {
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        if let Some(failure) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(failure);
        }
        let mut published = self
            .published
            .lock()
            .map_err(|_| PublishError::Rejected("sink poisoned".to_string()))?;
        published.push(RecordedPublish {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
