//! SUBSCRIBE and UNSUBSCRIBE packet handling.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, Publish, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::validation::{topic_matches_filter, validate_topic_filter_with_max_levels};
use crate::topic::Subscription;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        _session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut accepted = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in &subscribe.subscriptions {
            if validate_topic_filter_with_max_levels(&sub.filter, self.config.max_topic_levels).is_err() {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            if !self.config.wildcard_subscription_available
                && (sub.filter.contains('+') || sub.filter.contains('#'))
            {
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let allowed = self
                .hooks
                .on_subscribe_check(client_id, self.username.as_deref(), &sub.filter, sub.qos)
                .await
                .unwrap_or_else(|e| {
                    debug!("ACL check error for {}: {}", client_id, e);
                    false
                });

            if !allowed {
                debug!("SUBSCRIBE denied for {} to {} (ACL)", client_id, sub.filter);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let granted_qos = sub.qos.min(self.config.max_qos);
            self.subscriptions.subscribe(
                &sub.filter,
                Subscription {
                    client_id: client_id.clone(),
                    qos: granted_qos,
                },
            );
            return_codes.push(SubscribeReturnCode::granted(granted_qos));
            accepted.push((sub.filter.clone(), granted_qos));

            debug!("SUBSCRIBE {} to {} (QoS {:?})", client_id, sub.filter, granted_qos);
        }

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        // Retained messages go out unconditionally for every accepted
        // filter, right after the SUBACK.
        for (filter, qos) in accepted {
            self.send_retained_for_filter(&filter, qos).await;
        }

        Ok(())
    }

    async fn send_retained_for_filter(&mut self, filter: &str, qos: QoS) {
        let matching: Vec<_> = self
            .retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();

        for retained in matching {
            let effective_qos = retained.qos.min(qos);
            let publish = Publish {
                dup: false,
                qos: effective_qos,
                retain: true,
                topic: retained.topic.clone(),
                packet_id: None,
                payload: retained.payload.clone(),
            };
            if let Some(ref writer) = self.shared_writer {
                writer.send_publish(publish);
            }
        }
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        _session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            self.subscriptions.unsubscribe(filter, client_id);
            debug!("UNSUBSCRIBE {} from {}", client_id, filter);
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }
}
