//! On-disk representations of broker state.
//!
//! These mirror the runtime types in `broker`/`session`/`protocol` but are
//! plain, `bincode`-encodable structs: no `Arc`, no `Instant`, no
//! `parking_lot` locks. Timestamps are stored as Unix seconds and converted
//! back to `Instant` on load via a fixed reference point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};
use bytes::Bytes;

use crate::broker::RetainedMessage;
use crate::protocol::{ProtocolVersion, Publish, QoS};
use crate::session::{Qos2OutboundEntry, Qos2Phase, Session, SessionState, WillMessage};

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `Instant` has no absolute epoch, so stored durations are relative to
/// "now" at the moment of encoding/decoding rather than a true timestamp.
fn instant_to_unix_secs(instant: Instant) -> u64 {
    now_unix_secs().saturating_sub(instant.elapsed().as_secs())
}

fn unix_secs_to_instant(secs: u64) -> Instant {
    let age = now_unix_secs().saturating_sub(secs);
    Instant::now() - std::time::Duration::from_secs(age)
}

fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}

fn qos_from_u8(value: u8) -> QoS {
    match value {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn protocol_version_to_u8(version: ProtocolVersion) -> u8 {
    match version {
        ProtocolVersion::V311 => 4,
        ProtocolVersion::V5 => 5,
    }
}

fn protocol_version_from_u8(value: u8) -> ProtocolVersion {
    match value {
        5 => ProtocolVersion::V5,
        _ => ProtocolVersion::V311,
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub timestamp_secs: u64,
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(msg: &RetainedMessage) -> Self {
        Self {
            topic: msg.topic.to_string(),
            payload: msg.payload.to_vec(),
            qos: qos_to_u8(msg.qos),
            timestamp_secs: instant_to_unix_secs(msg.timestamp),
        }
    }
}

impl From<StoredRetainedMessage> for RetainedMessage {
    fn from(stored: StoredRetainedMessage) -> Self {
        Self {
            topic: Arc::from(stored.topic.as_str()),
            payload: Bytes::from(stored.payload),
            qos: qos_from_u8(stored.qos),
            timestamp: unix_secs_to_instant(stored.timestamp_secs),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: qos_to_u8(publish.qos),
            retain: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            dup: stored.dup,
            qos: qos_from_u8(stored.qos),
            retain: stored.retain,
            topic: Arc::from(stored.topic.as_str()),
            packet_id: stored.packet_id,
            payload: Bytes::from(stored.payload),
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

impl From<&WillMessage> for StoredWillMessage {
    fn from(will: &WillMessage) -> Self {
        Self {
            topic: will.topic.clone(),
            payload: will.payload.to_vec(),
            qos: qos_to_u8(will.qos),
            retain: will.retain,
        }
    }
}

impl From<StoredWillMessage> for WillMessage {
    fn from(stored: StoredWillMessage) -> Self {
        Self {
            topic: stored.topic,
            payload: Bytes::from(stored.payload),
            qos: qos_from_u8(stored.qos),
            retain: stored.retain,
        }
    }
}

/// Phase of a persisted outbound QoS 2 exchange; `0` = PUBLISH sent and
/// waiting for PUBREC, `1` = PUBREL sent and waiting for PUBCOMP.
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredQos2Outbound {
    pub packet_id: u16,
    pub publish: StoredPublish,
    pub phase: u8,
}

/// Snapshot of a non-clean session, written when its connection disconnects
/// and restored into the `SessionStore` at broker startup.
#[derive(Debug, Clone, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub protocol_version: u8,
    pub keep_alive: u16,
    pub will: Option<StoredWillMessage>,
    pub queued_while_offline: Vec<StoredPublish>,
    pub inflight_qos1: Vec<(u16, StoredPublish)>,
    pub inflight_qos2_outbound: Vec<StoredQos2Outbound>,
    pub inbound_qos2_pending: Vec<u16>,
}

impl From<&Session> for StoredSession {
    fn from(session: &Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            protocol_version: protocol_version_to_u8(session.protocol_version),
            keep_alive: session.keep_alive,
            will: session.will.as_ref().map(StoredWillMessage::from),
            queued_while_offline: session.queued_while_offline.iter().map(StoredPublish::from).collect(),
            inflight_qos1: session
                .inflight_qos1
                .iter()
                .map(|(id, publish)| (*id, StoredPublish::from(publish)))
                .collect(),
            inflight_qos2_outbound: session
                .inflight_qos2_outbound
                .iter()
                .map(|(id, entry)| StoredQos2Outbound {
                    packet_id: *id,
                    publish: StoredPublish::from(&entry.publish),
                    phase: match entry.phase {
                        Qos2Phase::Published => 0,
                        Qos2Phase::PubrelSent => 1,
                    },
                })
                .collect(),
            inbound_qos2_pending: session.inbound_qos2_pending.iter().copied().collect(),
        }
    }
}

impl StoredSession {
    /// Rebuild a disconnected, non-clean `Session` from a snapshot.
    pub fn into_session(self) -> Session {
        let client_id: Arc<str> = Arc::from(self.client_id.as_str());
        let will = self.will.map(WillMessage::from);
        let mut session = Session::new(
            client_id,
            protocol_version_from_u8(self.protocol_version),
            false,
            will,
            self.keep_alive,
        );
        session.state = SessionState::Disconnected;
        session.queued_while_offline = VecDeque::from_iter(self.queued_while_offline.into_iter().map(Publish::from));
        session.inflight_qos1 = self
            .inflight_qos1
            .into_iter()
            .map(|(id, publish)| (id, Publish::from(publish)))
            .collect();
        session.inflight_qos2_outbound = self
            .inflight_qos2_outbound
            .into_iter()
            .map(|entry| {
                (
                    entry.packet_id,
                    Qos2OutboundEntry {
                        publish: Publish::from(entry.publish),
                        phase: if entry.phase == 1 {
                            Qos2Phase::PubrelSent
                        } else {
                            Qos2Phase::Published
                        },
                    },
                )
            })
            .collect();
        session.inbound_qos2_pending = self.inbound_qos2_pending.into_iter().collect();
        session
    }
}

/// Everything `StorageBackend::load_all` reads back at startup.
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}
