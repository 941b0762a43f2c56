//! MQTT connection handler.
//!
//! One `Connection` per accepted socket: the CONNECT handshake, the read
//! loop, and the handful of packet handlers that make up the protocol
//! state machine after CONNECT.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConfig, BrokerEvent, RetainedMessage, SharedWriter};
use crate::buffer_pool;
use crate::codec::{Decoder, Encoder};
use crate::hooks::Hooks;
use crate::metrics::Metrics;
use crate::persistence::PersistenceManager;
use crate::protocol::Packet;
use crate::session::{keep_alive_timeout, Session, SessionStore};
use crate::topic::SubscriptionStore;

#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(crate::protocol::ProtocolError),
    Decode(crate::protocol::DecodeError),
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::Decode(e) => write!(f, "decode error: {}", e),
            ConnectionError::Timeout => write!(f, "connection timeout"),
            ConnectionError::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<crate::protocol::DecodeError> for ConnectionError {
    fn from(e: crate::protocol::DecodeError) -> Self {
        ConnectionError::Decode(e)
    }
}

pub(crate) enum State {
    Connecting,
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) subscriptions: Arc<SubscriptionStore>,
    pub(crate) retained: Arc<DashMap<Arc<str>, RetainedMessage>>,
    /// client_id -> SharedWriter, for direct cross-connection writes.
    pub(crate) connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
    pub(crate) config: BrokerConfig,
    pub(crate) events: broadcast::Sender<BrokerEvent>,
    /// Created once CONNECT completes successfully.
    pub(crate) shared_writer: Option<Arc<SharedWriter>>,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) metrics: Option<Arc<Metrics>>,
    pub(crate) persistence: Option<Arc<PersistenceManager>>,
    pub(crate) username: Option<String>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        addr: SocketAddr,
        sessions: Arc<SessionStore>,
        subscriptions: Arc<SubscriptionStore>,
        retained: Arc<DashMap<Arc<str>, RetainedMessage>>,
        connections: Arc<DashMap<Arc<str>, Arc<SharedWriter>>>,
        config: BrokerConfig,
        events: broadcast::Sender<BrokerEvent>,
        hooks: Arc<dyn Hooks>,
        metrics: Option<Arc<Metrics>>,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::default(),
            read_buf: buffer_pool::get_buffer(),
            write_buf: buffer_pool::get_buffer(),
            sessions,
            subscriptions,
            retained,
            connections,
            config,
            events,
            shared_writer: None,
            hooks,
            metrics,
            persistence,
            username: None,
        }
    }

    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = Duration::from_secs(30);
        match timeout(connect_timeout, self.read_connect()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("connect timeout from {}", self.addr);
                return Err(ConnectionError::Timeout);
            }
        }

        self.run_connected().await
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            _ => {
                return Err(ConnectionError::Protocol(
                    crate::protocol::ProtocolError::ProtocolViolation("not connected"),
                ))
            }
        };

        let keep_alive_secs = session.read().keep_alive;
        let keep_alive = keep_alive_timeout(keep_alive_secs).unwrap_or(Duration::from_secs(u64::MAX));
        debug!(
            "keep alive for {}: {}s -> timeout {:?}",
            client_id, keep_alive_secs, keep_alive
        );

        let mut resend_ticker = tokio::time::interval(self.config.inflight_resend_interval);
        resend_ticker.tick().await;

        let mut keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

        loop {
            tokio::select! {
                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            debug!("connection closed from {}", self.addr);
                            self.handle_disconnect(&client_id, &session, true).await;
                            return Ok(());
                        }
                        Ok(_) => {
                            while let Some((packet, consumed)) = self.decoder.decode(&self.read_buf)? {
                                self.read_buf.advance(consumed);

                                session.write().touch();
                                keep_alive_deadline = tokio::time::Instant::now() + keep_alive;

                                if let Err(e) = self.handle_packet(&client_id, &session, packet).await {
                                    match &e {
                                        ConnectionError::Shutdown => return Err(e),
                                        ConnectionError::Io(_) => {
                                            debug!("connection error: {}", e);
                                            self.handle_disconnect(&client_id, &session, true).await;
                                            return Err(e);
                                        }
                                        _ => {
                                            error!("error handling packet: {}", e);
                                            self.handle_disconnect(&client_id, &session, true).await;
                                            return Err(e);
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read error: {}", e);
                            self.handle_disconnect(&client_id, &session, true).await;
                            return Err(e.into());
                        }
                    }
                }

                _ = async {
                    if let Some(ref writer) = self.shared_writer {
                        writer.notified().await
                    } else {
                        std::future::pending::<()>().await
                    }
                } => {
                    if let Some(writer) = self.shared_writer.clone() {
                        let data = writer.take_buffer();
                        if !data.is_empty() {
                            let bytes_sent = data.len();
                            self.stream.write_all(&data).await?;
                            if self.config.immediate_buffer_flush {
                                self.stream.flush().await?;
                            }
                            if let Some(ref metrics) = self.metrics {
                                metrics.publish_sent(bytes_sent);
                            }
                        }
                        if !writer.is_alive() {
                            debug!("writer closed, disconnecting {}", client_id);
                            self.handle_disconnect(&client_id, &session, false).await;
                            return Err(ConnectionError::Shutdown);
                        }
                    }
                }

                _ = resend_ticker.tick() => {
                    if let Some(writer) = self.shared_writer.clone() {
                        // Draining here (even an empty buffer) is what lets a
                        // writer stuck not-writable by backpressure notice
                        // the backlog cleared and restore itself, since a
                        // quiet writer otherwise never calls take_buffer
                        // again once its last notify has been consumed.
                        let data = writer.take_buffer();
                        if !data.is_empty() {
                            self.stream.write_all(&data).await?;
                            if self.config.immediate_buffer_flush {
                                self.stream.flush().await?;
                            }
                        }
                        writer.resend_inflight();
                    }
                }

                _ = tokio::time::sleep_until(keep_alive_deadline) => {
                    info!("keep alive timeout for {}, disconnecting", client_id);
                    if let Some(ref metrics) = self.metrics {
                        metrics.keep_alive_timeout();
                    }
                    self.handle_disconnect(&client_id, &session, true).await;
                    return Err(ConnectionError::Timeout);
                }
            }
        }
    }

    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => Err(ConnectionError::Protocol(
                crate::protocol::ProtocolError::ProtocolViolation("duplicate CONNECT"),
            )),
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(puback) => self.handle_puback(session, puback).await,
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(session, pubrel).await,
            Packet::PubComp(pubcomp) => self.handle_pubcomp(session, pubcomp).await,
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, session, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, session, unsubscribe).await
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                // A clean DISCONNECT never fires the will, regardless of how
                // abruptly the socket closes afterward.
                self.handle_disconnect(client_id, session, false).await;
                Err(ConnectionError::Shutdown)
            }
            _ => {
                warn!("unexpected packet type from {}: {:?}", client_id, packet.packet_type());
                Ok(())
            }
        }
    }

    /// Return buffers to the pool for reuse by other connections.
    pub fn return_buffers(&mut self) {
        let read_buf = std::mem::take(&mut self.read_buf);
        let write_buf = std::mem::take(&mut self.write_buf);
        buffer_pool::put_buffer(read_buf);
        buffer_pool::put_buffer(write_buf);
    }
}

/// Generate a fresh 32-hex-char client ID for CONNECT packets that arrive
/// with an empty one. Two independently-seeded hashes of the current time
/// give 128 bits, same width as a UUID, without pulling in a uuid crate.
pub(crate) fn generate_client_id() -> Arc<str> {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut high_hasher = RandomState::new().build_hasher();
    high_hasher.write_u128(nanos);
    let high = high_hasher.finish();

    let mut low_hasher = RandomState::new().build_hasher();
    low_hasher.write_u128(nanos);
    low_hasher.write_u8(1);
    let low = low_hasher.finish();

    format!("{:016x}{:016x}", high, low).into()
}
