//! Direct write buffer for bypassing channel overhead.
//!
//! `SharedWriter` lets any connection's task append pre-encoded bytes
//! directly to another connection's write buffer, instead of routing
//! through an mpsc channel. The owning connection's task wakes on `Notify`
//! and flushes the buffer to its socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{Packet, ProtocolVersion, PubRel, Publish, QoS};
use crate::session::{Qos2OutboundEntry, Qos2Phase, Session};

/// Above this many buffered bytes, the writer is considered not writable:
/// further sends are treated as backpressure (QoS 0 dropped, QoS 1/2
/// deferred) instead of letting the buffer grow without bound under a slow
/// consumer.
const BACKPRESSURE_HIGH_WATER: usize = 1024 * 1024;

/// Writability is restored once a flush drains the buffer below this mark.
/// Kept below the high water mark so a consumer hovering near the
/// threshold doesn't flap writable/not-writable on every packet.
const BACKPRESSURE_LOW_WATER: usize = 256 * 1024;

/// Shared write buffer for direct writes between connections.
pub struct SharedWriter {
    /// Pre-serialized bytes waiting to be flushed to the socket.
    buffer: Mutex<BytesMut>,
    /// Session for packet_id assignment and in-flight tracking.
    session: Arc<RwLock<Session>>,
    /// Notified when the buffer gains data (or the writer closes).
    notify: Notify,
    encoder: Mutex<Encoder>,
    alive: AtomicBool,
    /// Transport writability, distinct from `alive`: a live connection whose
    /// socket can't keep up is not writable, but isn't closed either.
    writable: AtomicBool,
    max_packet_size: usize,
}

impl SharedWriter {
    pub fn new(
        session: Arc<RwLock<Session>>,
        protocol_version: ProtocolVersion,
        max_packet_size: usize,
    ) -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            session,
            notify: Notify::new(),
            encoder: Mutex::new(Encoder::new(protocol_version)),
            alive: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            max_packet_size,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Transport writability: false under backpressure (buffer above the
    /// high water mark) even while the connection is still alive.
    pub fn is_writable(&self) -> bool {
        self.is_alive() && self.writable.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer for flushing to the socket.
    /// If this flush drains the buffer back under the low water mark,
    /// writability is restored and the offline queue / live in-flight
    /// queue are drained through this writer.
    pub fn take_buffer(&self) -> BytesMut {
        let data = self.buffer.lock().split();

        if data.len() < BACKPRESSURE_LOW_WATER {
            let was_unwritable = !self.writable.swap(true, Ordering::AcqRel);
            if was_unwritable {
                self.resume_after_backpressure();
            }
        }

        data
    }

    /// Writability-restored hook: replays whatever queued up while this
    /// writer couldn't keep up, then nudges the resender for anything
    /// still unacknowledged.
    fn resume_after_backpressure(&self) {
        if !self.is_alive() {
            return;
        }
        let queued = self.session.write().drain_queued_while_offline();
        for publish in queued {
            self.send_publish(publish);
        }
        self.resend_inflight();
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn session(&self) -> &Arc<RwLock<Session>> {
        &self.session
    }

    /// Encode and append a packet that needs no in-flight tracking
    /// (CONNACK, PUBACK, PUBREC, PUBREL, PUBCOMP, SUBACK, UNSUBACK, PINGRESP).
    pub fn send_packet(&self, packet: &Packet) -> bool {
        if !self.is_writable() {
            return false;
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let encoder = self.encoder.lock();
            let start_len = buffer.len();
            if encoder.encode(packet, &mut buffer).is_err() {
                buffer.truncate(start_len);
                return false;
            }
            if buffer.len() - start_len > self.max_packet_size {
                buffer.truncate(start_len);
                return false;
            }
            if buffer.len() > BACKPRESSURE_HIGH_WATER {
                self.writable.store(false, Ordering::Release);
            }
            start_len == 0
        };

        if was_empty {
            self.notify.notify_one();
        }
        true
    }

    /// Send an outbound PUBLISH: assigns a packet_id and records in-flight
    /// state for QoS 1/2 before writing, so the state survives even if the
    /// connection dies before the write completes.
    pub fn send_publish(&self, mut publish: Publish) -> bool {
        match publish.qos {
            QoS::AtMostOnce => {
                if !self.is_writable() {
                    return false;
                }
                self.send_packet(&Packet::Publish(publish))
            }
            QoS::AtLeastOnce => {
                {
                    let mut session = self.session.write();
                    let packet_id = session.next_packet_id();
                    publish.packet_id = Some(packet_id);
                    session.inflight_qos1.insert(packet_id, publish.clone());
                }
                if !self.is_writable() {
                    return false;
                }
                self.send_packet(&Packet::Publish(publish))
            }
            QoS::ExactlyOnce => {
                {
                    let mut session = self.session.write();
                    let packet_id = session.next_packet_id();
                    publish.packet_id = Some(packet_id);
                    session.inflight_qos2_outbound.insert(
                        packet_id,
                        Qos2OutboundEntry {
                            publish: publish.clone(),
                            phase: Qos2Phase::Published,
                        },
                    );
                }
                if !self.is_writable() {
                    return false;
                }
                self.send_packet(&Packet::Publish(publish))
            }
        }
    }

    /// Re-send everything still unacknowledged, marking PUBLISH as DUP.
    /// Called by the InflightResender on its fixed tick.
    pub fn resend_inflight(&self) {
        if !self.is_writable() {
            return;
        }

        let packets: Vec<Packet> = {
            let session = self.session.read();
            let mut packets = Vec::with_capacity(
                session.inflight_qos1.len() + session.inflight_qos2_outbound.len(),
            );

            for publish in session.inflight_qos1.values() {
                let mut dup = publish.clone();
                dup.dup = true;
                packets.push(Packet::Publish(dup));
            }

            for entry in session.inflight_qos2_outbound.values() {
                match entry.phase {
                    Qos2Phase::Published => {
                        let mut dup = entry.publish.clone();
                        dup.dup = true;
                        packets.push(Packet::Publish(dup));
                    }
                    Qos2Phase::PubrelSent => {
                        if let Some(packet_id) = entry.publish.packet_id {
                            packets.push(Packet::PubRel(PubRel::new(packet_id)));
                        }
                    }
                }
            }
            packets
        };

        for packet in &packets {
            self.send_packet(packet);
        }
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("buffer_len", &self.buffer_len())
            .field("alive", &self.is_alive())
            .field("writable", &self.writable.load(Ordering::Acquire))
            .finish()
    }
}
