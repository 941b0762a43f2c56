//! Broker core: listener, shared routing state, and server-originated publish.
//!
//! One tokio task per accepted TCP connection. Session state and subscription
//! matching live in shared, lock-protected structures so a publish from any
//! connection's task can reach any other connection's writer directly.

mod connection;

pub use connection::{Connection, ConnectionError};
pub use writer::SharedWriter;

mod writer;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock as AsyncRwLock};
use tracing::{debug, info, warn};

use crate::hooks::{DefaultHooks, Hooks};
use crate::metrics::Metrics;
use crate::persistence::{PersistenceManager, PersistenceOp};
use crate::protocol::{Publish, QoS};
use crate::session::SessionStore;
use crate::topic::SubscriptionStore;

/// Configuration for a running broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub max_connections: usize,
    pub max_packet_size: usize,
    /// Keep-alive used if a client's CONNECT specifies 0.
    pub default_keep_alive: u16,
    pub max_keep_alive: u16,
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    /// Maximum number of levels a topic name/filter may contain (0 = unlimited).
    pub max_topic_levels: usize,
    /// Whether a zero-length client identifier is accepted for clean sessions.
    pub allow_zero_byte_client_id: bool,
    /// Whether the connection flushes its write buffer after every packet
    /// instead of batching until the read loop drains.
    pub immediate_buffer_flush: bool,
    /// Period between InflightResender ticks.
    pub inflight_resend_interval: Duration,
    /// Upper bound on messages queued for a disconnected, persistent session.
    pub max_queued_messages: usize,
    pub num_workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            max_connections: 100_000,
            max_packet_size: crate::codec::DEFAULT_MAX_PACKET_SIZE,
            default_keep_alive: 60,
            max_keep_alive: 0,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            max_topic_levels: 0,
            allow_zero_byte_client_id: true,
            immediate_buffer_flush: false,
            inflight_resend_interval: Duration::from_secs(5),
            max_queued_messages: 1000,
            num_workers: num_cpus::get(),
        }
    }
}

mod num_cpus {
    pub fn get() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

/// A retained message for a topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub timestamp: Instant,
}

/// Broker-level lifecycle events, for observers subscribed via `subscribe_events`.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    ClientConnected { client_id: Arc<str> },
    ClientDisconnected { client_id: Arc<str> },
    MessagePublished { topic: Arc<str>, qos: QoS },
}

/// Shared broker state: sessions, subscriptions, retained messages, and the
/// live connection map.
pub struct Broker {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<DashMap<Arc<str>, RetainedMessage>>,
    connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    shutdown: broadcast::Sender<()>,
    events: broadcast::Sender<BrokerEvent>,
    hooks: Arc<dyn Hooks>,
    metrics: AsyncRwLock<Option<Arc<Metrics>>>,
    persistence: AsyncRwLock<Option<Arc<PersistenceManager>>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything).
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks (authentication, ACL, events).
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            subscriptions: Arc::new(SubscriptionStore::new()),
            retained: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            shutdown,
            events,
            hooks,
            metrics: AsyncRwLock::new(None),
            persistence: AsyncRwLock::new(None),
        }
    }

    pub async fn set_metrics(&self, metrics: Arc<Metrics>) {
        *self.metrics.write().await = Some(metrics);
    }

    pub async fn set_persistence(&self, persistence: Arc<PersistenceManager>) {
        *self.persistence.write().await = Some(persistence);
    }

    /// Seed a retained message restored from persistence at startup.
    pub fn restore_retained(&self, message: RetainedMessage) {
        self.retained.insert(message.topic.clone(), message);
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn retained(&self) -> &Arc<DashMap<Arc<str>, RetainedMessage>> {
        &self.retained
    }

    /// Run the broker: bind the listener and accept connections until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown.subscribe();

        debug!("Starting TCP accept loop");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if self.connections.len() >= self.config.max_connections {
                                debug!("Rejecting connection from {}: at max_connections", addr);
                                continue;
                            }
                            debug!("New TCP connection from {}", addr);
                            let _ = stream.set_nodelay(true);
                            self.clone().handle_connection(stream, addr);
                        }
                        Err(e) => {
                            warn!("Failed to accept TCP connection: {}", e);
                        }
                    }
                }
                result = shutdown_rx.recv() => {
                    match result {
                        Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                            info!("Broker shutting down");
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    }
                }
            }
        }
    }

    /// Handle a new connection: spawn a task for its whole lifetime.
    fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let metrics = self.metrics.read().await.clone();
            let persistence = self.persistence.read().await.clone();

            let mut conn = Connection::new(
                stream,
                addr,
                self.sessions.clone(),
                self.subscriptions.clone(),
                self.retained.clone(),
                self.connections.clone(),
                self.config.clone(),
                self.events.clone(),
                self.hooks.clone(),
                metrics,
                persistence,
            );

            let conn_fut = conn.run();
            tokio::pin!(conn_fut);

            loop {
                tokio::select! {
                    biased;

                    result = &mut conn_fut => {
                        if let Err(e) = result {
                            debug!("Connection error from {}: {}", addr, e);
                        }
                        break;
                    }
                    result = shutdown_rx.recv() => {
                        match result {
                            Ok(()) | Err(broadcast::error::RecvError::Closed) => {
                                debug!("Connection {} shutting down", addr);
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        }
                    }
                }
            }

            conn.return_buffers();
        });
    }

    /// Request the accept loop and all spawned connections to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Publish a message on behalf of the server itself (not a connected
    /// client) — used for will delivery and administrative injection.
    ///
    /// Routes to every matching subscriber: delivered live if connected,
    /// queued for later delivery on a persistent but offline session.
    pub async fn publish(&self, publish: Publish) {
        route_publish(
            &self.config,
            &self.retained,
            &self.subscriptions,
            &self.connections,
            &self.sessions,
            self.metrics.read().await.as_ref(),
            self.persistence.read().await.as_ref(),
            &self.events,
            &self.hooks,
            publish,
        )
        .await;
    }
}

/// Store-and-route logic shared by `Broker::publish` (server-originated:
/// wills, administrative injection) and `Connection::handle_publish`
/// (client-originated), so both paths apply retained-message handling and
/// subscriber fan-out identically.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn route_publish(
    config: &BrokerConfig,
    retained: &DashMap<Arc<str>, RetainedMessage>,
    subscriptions: &SubscriptionStore,
    connections: &DashMap<Arc<str>, Arc<SharedWriter>>,
    sessions: &SessionStore,
    metrics: Option<&Arc<Metrics>>,
    persistence: Option<&Arc<PersistenceManager>>,
    events: &broadcast::Sender<BrokerEvent>,
    hooks: &Arc<dyn Hooks>,
    mut publish: Publish,
) {
    let qos = publish.qos.min(config.max_qos);
    publish.qos = qos;

    if publish.retain {
        if config.retain_available {
            if publish.payload.is_empty() {
                retained.remove(&publish.topic);
                if let Some(persistence) = persistence {
                    persistence.write(PersistenceOp::DeleteRetained {
                        topic: publish.topic.to_string(),
                    });
                }
            } else {
                let retained_msg = RetainedMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                    qos,
                    timestamp: Instant::now(),
                };
                if let Some(metrics) = metrics {
                    metrics.retained_message_stored(retained_msg.payload.len());
                }
                if let Some(persistence) = persistence {
                    persistence.write(PersistenceOp::SetRetained {
                        topic: publish.topic.to_string(),
                        message: (&retained_msg).into(),
                    });
                }
                retained.insert(publish.topic.clone(), retained_msg);
            }
        }
        publish.retain = false;
    }

    let subscribers = subscriptions.matches(&publish.topic);

    for subscription in subscribers {
        let delivered_qos = qos.min(subscription.qos);
        let mut outbound = publish.clone();
        outbound.qos = delivered_qos;

        if let Some(writer) = connections.get(&subscription.client_id) {
            if !writer.send_publish(outbound) {
                warn!("failed to deliver to connected client {}", subscription.client_id);
            }
            continue;
        }

        if let Some(session) = sessions.get(&subscription.client_id) {
            let mut session = session.write();
            if !session.clean {
                session.queue_while_offline(outbound);
            }
        }
    }

    let _ = events.send(BrokerEvent::MessagePublished {
        topic: publish.topic.clone(),
        qos,
    });
    hooks.on_message_published(&publish.topic, &publish.payload, qos).await;
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
