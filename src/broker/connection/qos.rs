//! Outbound QoS acknowledgment handling: PUBACK, PUBREC, PUBREL, PUBCOMP.
//!
//! Periodic resend of unacknowledged entries lives on `SharedWriter`
//! (`resend_inflight`), driven by the connection's own select loop.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel};
use crate::session::{Qos2Phase, Session};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_puback(
        &mut self,
        session: &Arc<RwLock<Session>>,
        puback: PubAck,
    ) -> Result<(), ConnectionError> {
        session.write().inflight_qos1.remove(&puback.packet_id);
        Ok(())
    }

    pub(crate) async fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            if let Some(entry) = s.inflight_qos2_outbound.get_mut(&pubrec.packet_id) {
                entry.phase = Qos2Phase::PubrelSent;
                entry.publish.payload = bytes::Bytes::new();
            }
        }
        self.write_packet(&Packet::PubRel(PubRel::new(pubrec.packet_id))).await
    }

    pub(crate) async fn handle_pubrel(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        // Idempotent: an unknown packet_id still gets a PUBCOMP.
        session.write().inbound_qos2_pending.remove(&pubrel.packet_id);
        self.write_packet(&Packet::PubComp(PubComp::new(pubrel.packet_id))).await
    }

    pub(crate) async fn handle_pubcomp(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubcomp: PubComp,
    ) -> Result<(), ConnectionError> {
        session.write().inflight_qos2_outbound.remove(&pubcomp.packet_id);
        Ok(())
    }
}
