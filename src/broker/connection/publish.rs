//! Inbound PUBLISH handling: topic validation, ACL check, and the three
//! QoS receive state machines.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::{Connection, ConnectionError};
use crate::broker::route_publish;
use crate::protocol::{Packet, PubAck, PubRec, Publish, QoS};
use crate::session::Session;
use crate::topic::validate_topic_name_with_max_levels;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        // Invalid topic name is a protocol violation: close, no ack of any
        // kind, and no QoS-specific branch runs.
        if let Err(e) = validate_topic_name_with_max_levels(&publish.topic, self.config.max_topic_levels) {
            warn!("invalid topic name from {}: {}", client_id, e);
            return Err(ConnectionError::Protocol(
                crate::protocol::ProtocolError::ProtocolViolation("invalid topic name"),
            ));
        }

        let allowed = self
            .hooks
            .on_publish_check(client_id, self.username.as_deref(), &publish.topic, publish.qos, publish.retain)
            .await
            .unwrap_or_else(|e| {
                warn!("publish ACL check error for {}: {}", client_id, e);
                false
            });

        if !allowed {
            debug!("PUBLISH denied for {} to {} (ACL)", client_id, publish.topic);
            return Ok(());
        }

        trace!("PUBLISH from {} to {} (QoS {:?})", client_id, publish.topic, publish.qos);

        match publish.qos {
            QoS::AtMostOnce => {
                self.deliver(publish).await;
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or(ConnectionError::Protocol(
                    crate::protocol::ProtocolError::ProtocolViolation("QoS 1 PUBLISH missing packet id"),
                ))?;
                // Deliver before acking: at-least-once upstream semantics.
                self.deliver(publish).await;
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id))).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(ConnectionError::Protocol(
                    crate::protocol::ProtocolError::ProtocolViolation("QoS 2 PUBLISH missing packet id"),
                ))?;

                let already_pending = session.read().inbound_qos2_pending.contains(&packet_id);
                if !already_pending {
                    session.write().inbound_qos2_pending.insert(packet_id);
                    self.deliver(publish).await;
                }
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id))).await?;
            }
        }

        Ok(())
    }

    async fn deliver(&self, publish: Publish) {
        route_publish(
            &self.config,
            &self.retained,
            &self.subscriptions,
            &self.connections,
            &self.sessions,
            self.metrics.as_ref(),
            self.persistence.as_ref(),
            &self.events,
            &self.hooks,
            publish,
        )
        .await;
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }
}
