//! MQTT Session Management
//!
//! Per-client session state: QoS 1/2 in-flight tracking, the QoS-2
//! inbound dedup set, messages queued while the client is offline, will,
//! and the clean/persistent lifecycle flag. Subscriptions themselves live
//! in the topic routing fabric, not here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{ProtocolVersion, Publish, QoS};

/// Maximum number of messages queued for a disconnected, persistent session.
const MAX_QUEUED_WHILE_OFFLINE: usize = 1000;

/// Idle duration after which a connection with this keep_alive may be
/// dropped: ceil(keep_alive * 1.5) seconds, `None` if keep-alive is disabled.
/// Single source of truth for both `Session::is_keep_alive_expired` and the
/// connection's read-loop deadline, so the two can't drift apart.
pub fn keep_alive_timeout(keep_alive: u16) -> Option<Duration> {
    if keep_alive == 0 {
        return None;
    }
    let idle_seconds = (keep_alive as u64 * 3).div_ceil(2);
    Some(Duration::from_secs(idle_seconds))
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Destroyed,
}

/// Phase of an outbound QoS 2 exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2Phase {
    /// PUBLISH sent, waiting for PUBREC.
    Published,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP.
    PubrelSent,
}

/// An in-flight outbound QoS 2 exchange.
#[derive(Debug, Clone)]
pub struct Qos2OutboundEntry {
    pub publish: Publish,
    pub phase: Qos2Phase,
}

/// Will message captured from CONNECT, fired on abrupt disconnect.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Per-client session state.
pub struct Session {
    pub client_id: Arc<str>,
    /// Protocol version negotiated at CONNECT; kept for logging only since
    /// every packet after CONNECT uses the same wire shape.
    pub protocol_version: ProtocolVersion,
    /// clean=true sessions are destroyed on disconnect instead of retained.
    pub clean: bool,
    pub will: Option<WillMessage>,
    pub queued_while_offline: VecDeque<Publish>,
    pub inflight_qos1: HashMap<u16, Publish>,
    pub inflight_qos2_outbound: HashMap<u16, Qos2OutboundEntry>,
    pub inbound_qos2_pending: HashSet<u16>,
    pub state: SessionState,
    pub keep_alive: u16,
    pub last_activity: Instant,
    next_packet_id: u16,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        clean: bool,
        will: Option<WillMessage>,
        keep_alive: u16,
    ) -> Self {
        Self {
            client_id,
            protocol_version,
            clean,
            will,
            queued_while_offline: VecDeque::new(),
            inflight_qos1: HashMap::new(),
            inflight_qos2_outbound: HashMap::new(),
            inbound_qos2_pending: HashSet::new(),
            state: SessionState::Connecting,
            keep_alive,
            last_activity: Instant::now(),
            next_packet_id: 1,
        }
    }

    /// Allocate the next outbound packet identifier. Wraps 65535 -> 1, never 0,
    /// and skips any value currently in flight.
    pub fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight_qos1.contains_key(&id) && !self.inflight_qos2_outbound.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Server may close the channel once idle beyond ceil(keep_alive * 1.5) seconds.
    pub fn is_keep_alive_expired(&self) -> bool {
        match keep_alive_timeout(self.keep_alive) {
            Some(timeout) => self.last_activity.elapsed() > timeout,
            None => false,
        }
    }

    /// Transition into the handshake-in-progress state. Used when a registry
    /// reopens an existing session for a fresh CONNECT.
    pub fn bind(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// Complete the CONNECTING -> CONNECTED transition. Returns false if a
    /// competing binder already won the race (state is already CONNECTED).
    pub fn complete_connection(&mut self) -> bool {
        if self.state == SessionState::Connected {
            return false;
        }
        self.state = SessionState::Connected;
        self.touch();
        true
    }

    /// Clean (client-initiated) or abrupt disconnect. Does not decide
    /// clean-session destruction; the registry does that.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnecting;
        self.state = SessionState::Disconnected;
    }

    pub fn destroy(&mut self) {
        self.state = SessionState::Destroyed;
    }

    /// Queue an outbound message while disconnected. Drops the oldest entry
    /// once the bound is reached.
    pub fn queue_while_offline(&mut self, publish: Publish) {
        if self.queued_while_offline.len() >= MAX_QUEUED_WHILE_OFFLINE {
            self.queued_while_offline.pop_front();
        }
        self.queued_while_offline.push_back(publish);
    }

    /// Take and clear everything queued while offline, in order.
    pub fn drain_queued_while_offline(&mut self) -> VecDeque<Publish> {
        std::mem::take(&mut self.queued_while_offline)
    }
}

/// How the registry resolved a CONNECT against existing session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    CreateNew,
    ReopenExisting,
    DropExistingReopen,
}

/// Result of `SessionStore::create_or_reopen`.
pub struct BindResult {
    pub session: Arc<RwLock<Session>>,
    pub already_stored: bool,
    pub mode: BindMode,
    /// True if a prior CONNECTED session was displaced by this bind; the
    /// caller must close that session's live connection (session takeover).
    pub took_over: bool,
}

/// Authoritative `clientId -> Session` mapping.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Resolve a CONNECT against existing state for this client ID.
    ///
    /// Uses a single `entry()` call rather than a `get` followed by an
    /// `insert` so two concurrent CONNECTs for a brand-new client_id can't
    /// both observe `Vacant` and both create a session: the shard stays
    /// locked for the whole match, keeping create/reopen atomic.
    pub fn create_or_reopen(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean: bool,
    ) -> BindResult {
        let client_id: Arc<str> = client_id.into();

        match self.sessions.entry(client_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get().clone();
                let took_over = existing.read().state == SessionState::Connected;

                if clean {
                    // Client now wants a clean start: drop whatever was stored.
                    let session = Arc::new(RwLock::new(Session::new(
                        client_id,
                        protocol_version,
                        true,
                        None,
                        0,
                    )));
                    occupied.insert(session.clone());
                    BindResult {
                        session,
                        already_stored: false,
                        mode: BindMode::DropExistingReopen,
                        took_over,
                    }
                } else {
                    {
                        let mut s = existing.write();
                        s.protocol_version = protocol_version;
                        s.clean = false;
                        s.bind();
                    }
                    BindResult {
                        session: existing,
                        already_stored: true,
                        mode: BindMode::ReopenExisting,
                        took_over,
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let session = Arc::new(RwLock::new(Session::new(
                    client_id,
                    protocol_version,
                    clean,
                    None,
                    0,
                )));
                vacant.insert(session.clone());
                BindResult {
                    session,
                    already_stored: false,
                    mode: BindMode::CreateNew,
                    took_over: false,
                }
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Insert a session reconstructed from persisted state, for example at
    /// broker startup. Does not check for an existing entry: startup restore
    /// runs before any connection is accepted.
    pub fn restore(&self, session: Session) {
        self.sessions.insert(session.client_id.clone(), Arc::new(RwLock::new(session)));
    }

    /// Destroy a session outright (clean-session disconnect, failed takeover).
    pub fn remove(&self, client_id: &str) {
        if let Some((_, session)) = self.sessions.remove(client_id) {
            session.write().destroy();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
