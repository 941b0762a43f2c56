//! Clean disconnect and abrupt connection loss, including will delivery.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::Connection;
use crate::broker::{route_publish, BrokerEvent};
use crate::persistence::{PersistenceOp, StoredSession};
use crate::protocol::Publish;
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Called exactly once per connection's lifetime, whether the client
    /// sent DISCONNECT (`fire_will = false`) or the socket went away
    /// unexpectedly (`fire_will = true`).
    pub(crate) async fn handle_disconnect(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        fire_will: bool,
    ) {
        // If a newer connection has already taken this client_id over, this
        // task's session handle is stale; don't let it clobber live state.
        let is_current = match (&self.shared_writer, self.connections.get(client_id)) {
            (Some(mine), Some(registered)) => Arc::ptr_eq(mine, registered.value()),
            _ => false,
        };

        if let Some(writer) = self.shared_writer.take() {
            writer.close();
        }

        if !is_current {
            return;
        }

        self.connections.remove(client_id);

        if fire_will {
            let will = session.write().will.take();
            if let Some(will) = will {
                debug!("publishing will for {} to {}", client_id, will.topic);
                let publish = Publish {
                    dup: false,
                    qos: will.qos,
                    retain: will.retain,
                    topic: Arc::from(will.topic.as_str()),
                    packet_id: None,
                    payload: will.payload,
                };
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
        }

        let clean = {
            let mut s = session.write();
            s.disconnect();
            s.clean
        };

        if clean {
            self.sessions.remove(client_id);
            self.subscriptions.unsubscribe_all(client_id);
            if let Some(ref persistence) = self.persistence {
                persistence.write(PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        } else if let Some(ref persistence) = self.persistence {
            let stored = StoredSession::from(&*session.read());
            persistence.write(PersistenceOp::SetSession {
                client_id: client_id.to_string(),
                session: stored,
            });
        }

        let _ = self.events.send(BrokerEvent::ClientDisconnected {
            client_id: client_id.clone(),
        });
        self.hooks.on_client_disconnected(client_id, !fire_will).await;

        debug!(
            "client {} disconnected (clean={}, fire_will={})",
            client_id, clean, fire_will
        );
    }
}
