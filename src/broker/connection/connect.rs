//! CONNECT handshake.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{generate_client_id, Connection, ConnectionError, State};
use crate::broker::{BrokerEvent, SharedWriter};
use crate::protocol::{Connect, ConnAck, ConnectReturnCode, DecodeError, Packet};
use crate::session::{BindMode, WillMessage};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read packets until a CONNECT arrives, then run the handshake. Any
    /// other first packet, or a failure of the handshake itself, is a
    /// protocol violation: no packet but CONNECT is legal before CONNACK.
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    bytes::Buf::advance(&mut self.read_buf, consumed);
                    match packet {
                        Packet::Connect(connect) => return self.handle_connect(*connect).await,
                        _ => {
                            debug!("first packet from {} was not CONNECT", self.addr);
                            return Err(ConnectionError::Protocol(
                                crate::protocol::ProtocolError::ProtocolViolation(
                                    "first packet must be CONNECT",
                                ),
                            ));
                        }
                    }
                }
                Ok(None) => {}
                Err(DecodeError::InvalidProtocolVersion(v)) => {
                    debug!("rejecting unsupported protocol version {} from {}", v, self.addr);
                    let connack = ConnAck {
                        session_present: false,
                        return_code: ConnectReturnCode::UnacceptableProtocolVersion,
                    };
                    let mut buf = bytes::BytesMut::new();
                    if self.encoder.encode(&Packet::ConnAck(connack), &mut buf).is_ok() {
                        let _ = self.stream.write_all(&buf).await;
                        let _ = self.stream.flush().await;
                    }
                    return Err(DecodeError::InvalidProtocolVersion(v).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )));
            }
        }
    }

    async fn reject(&mut self, reason_code: ConnectReturnCode, reason: &'static str) -> Result<(), ConnectionError> {
        let connack = ConnAck {
            session_present: false,
            return_code: reason_code,
        };
        self.write_buf.clear();
        self.encoder
            .encode(&Packet::ConnAck(connack), &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Err(ConnectionError::Protocol(
            crate::protocol::ProtocolError::ProtocolViolation(reason),
        ))
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        let protocol_version = connect.protocol_version;
        self.decoder.set_protocol_version(protocol_version);
        self.encoder.set_protocol_version(protocol_version);

        // Client identifier policy (step 2).
        if connect.client_id.is_empty() {
            if !self.config.allow_zero_byte_client_id {
                debug!("rejecting empty client ID (disallowed) from {}", self.addr);
                return self
                    .reject(ConnectReturnCode::IdentifierRejected, "zero-byte client id disallowed")
                    .await;
            }
            if !connect.clean_start {
                debug!("rejecting empty client ID with clean_start=false from {}", self.addr);
                return self
                    .reject(ConnectReturnCode::IdentifierRejected, "empty client id requires clean start")
                    .await;
            }
        }
        let client_id: Arc<str> = if connect.client_id.is_empty() {
            generate_client_id()
        } else {
            connect.client_id.clone().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        // Authentication (step 3) — delegated to hooks, which own the
        // anonymous-access and credential-verification policy.
        match self
            .hooks
            .on_authenticate(&client_id, connect.username.as_deref(), connect.password.as_deref())
            .await
        {
            Ok(true) => {
                self.username = connect.username.clone();
            }
            Ok(false) => {
                debug!("authentication failed for {}", client_id);
                return self
                    .reject(ConnectReturnCode::BadUserNameOrPassword, "authentication failed")
                    .await;
            }
            Err(e) => {
                warn!("authentication error for {}: {}", client_id, e);
                return self
                    .reject(ConnectReturnCode::ServerUnavailable, "authentication error")
                    .await;
            }
        }

        // Session bind (step 4).
        let bind = self
            .sessions
            .create_or_reopen(&client_id, protocol_version, connect.clean_start);

        if bind.took_over {
            if let Some(prior) = self.connections.get(&client_id) {
                prior.close();
            }
        }

        if bind.mode == BindMode::DropExistingReopen {
            if let Some(ref persistence) = self.persistence {
                persistence.write(crate::persistence::PersistenceOp::DeleteSession {
                    client_id: client_id.to_string(),
                });
            }
        }

        {
            let mut s = bind.session.write();
            s.keep_alive = if connect.keep_alive == 0 {
                self.config.default_keep_alive
            } else if self.config.max_keep_alive > 0 {
                connect.keep_alive.min(self.config.max_keep_alive)
            } else {
                connect.keep_alive
            };
            s.will = connect.will.map(|w| WillMessage {
                topic: w.topic,
                payload: w.payload,
                qos: w.qos,
                retain: w.retain,
            });
            s.touch();
        }

        let writer = Arc::new(SharedWriter::new(
            bind.session.clone(),
            protocol_version,
            self.config.max_packet_size,
        ));
        self.connections.insert(client_id.clone(), writer.clone());
        self.shared_writer = Some(writer);

        // Send CONNACK (step 5) — always the first packet written.
        let connack = ConnAck {
            session_present: bind.already_stored,
            return_code: ConnectReturnCode::Accepted,
        };
        self.write_buf.clear();
        self.encoder
            .encode(&Packet::ConnAck(connack), &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;

        // Post-CONNACK callback (step 6).
        if !bind.session.write().complete_connection() {
            warn!("lost CONNECTING race for {}", client_id);
            let disconnect_buf = {
                let mut buf = bytes::BytesMut::new();
                let _ = self.encoder.encode(&Packet::Disconnect, &mut buf);
                buf
            };
            let _ = self.stream.write_all(&disconnect_buf).await;
            return Err(ConnectionError::Protocol(
                crate::protocol::ProtocolError::ProtocolViolation("lost connecting race"),
            ));
        }

        self.state = State::Connected {
            client_id: client_id.clone(),
            session: bind.session.clone(),
        };

        if bind.mode == BindMode::ReopenExisting {
            let queued = bind.session.write().drain_queued_while_offline();
            if let Some(ref writer) = self.shared_writer {
                for publish in queued {
                    writer.send_publish(publish);
                }
                writer.resend_inflight();
            }
        }

        let _ = self.events.send(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
        });
        self.hooks.on_client_connected(&client_id, self.username.as_deref()).await;

        Ok(())
    }
}
