//! CONNECT packet handling

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, info};

use super::{Connection, ConnectionError, State};
use crate::broker::{ClientWriter, CloseReason};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, ProtocolError,
};
use crate::session::WillMessage;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read the first packet, which must be CONNECT [MQTT-3.1.0-1]
    pub(crate) async fn read_connect(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    use bytes::Buf;
                    self.read_buf.advance(consumed);

                    match packet {
                        Packet::Connect(connect) => {
                            return self.handle_connect(*connect).await;
                        }
                        other => {
                            error!(
                                "[MQTT-3.1.0-1] first packet from {} was type {}, not CONNECT",
                                self.addr,
                                other.packet_type()
                            );
                            return Err(ConnectionError::Protocol(
                                ProtocolError::ProtocolViolation("first packet must be CONNECT"),
                            ));
                        }
                    }
                }
                Ok(None) => {
                    // Need more data
                }
                Err(DecodeError::InvalidProtocolName) => {
                    error!("[MQTT-3.1.2-1] wrong protocol name from {}", self.addr);
                    return Err(DecodeError::InvalidProtocolName.into());
                }
                Err(DecodeError::UnsupportedProtocolLevel(level)) => {
                    // Refused with return code 1 before closing [MQTT-3.1.2-2]
                    error!(
                        "[MQTT-3.1.2-2] wrong protocol version {} from {}",
                        level, self.addr
                    );
                    self.respond(&Packet::ConnAck(ConnAck {
                        session_present: false,
                        return_code: ConnectReturnCode::UnacceptableProtocolVersion,
                    }))
                    .await?;
                    return Err(DecodeError::UnsupportedProtocolLevel(level).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )));
            }
        }
    }

    /// Handle the CONNECT packet: client-id rules, takeover, session
    /// creation or resume, CONNACK, and in-flight replay.
    async fn handle_connect(&mut self, connect: Connect) -> Result<(), ConnectionError> {
        // [MQTT-3.1.3-8] a zero-byte client id requires clean_session=1
        if connect.client_id.is_empty() && !connect.clean_session {
            debug!(
                "rejecting empty client id with clean_session=0 from {}",
                self.addr
            );
            self.respond(&Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::IdentifierRejected,
            }))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "empty client id with clean_session=0",
            )));
        }

        // [MQTT-3.1.3-6] assign an id when the client sent none
        let client_id: Arc<str> = if connect.client_id.is_empty() {
            format!("wren-{:x}", super::rand_id()).into()
        } else {
            connect.client_id.as_str().into()
        };

        debug!("CONNECT from {} (client_id: {})", self.addr, client_id);

        if self.active.load(Ordering::SeqCst) > self.config.max_connections {
            debug!(
                "max connections ({}) reached, refusing {}",
                self.config.max_connections, client_id
            );
            self.respond(&Packet::ConnAck(ConnAck {
                session_present: false,
                return_code: ConnectReturnCode::ServerUnavailable,
            }))
            .await?;
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "max connections reached",
            )));
        }

        // [MQTT-3.1.4-2] a connected client with the same id is disconnected
        // first; its teardown does not fire the will and leaves session state
        // to this connection.
        if let Some(existing) = self.engine.get_client(&client_id) {
            let old_writer = existing.read().writer();
            if let Some(old_writer) = old_writer {
                info!("[MQTT-3.1.4-2] disconnecting old client {}", client_id);
                old_writer.close(CloseReason::Takeover);
            }
        }

        let (session, resumed) = self.engine.connect(&client_id, connect.clean_session);
        let writer = Arc::new(ClientWriter::new());

        {
            let mut s = session.write();
            s.clean_session = connect.clean_session;
            s.keep_alive = connect.keep_alive;
            s.will = connect.will.map(|w| WillMessage {
                topic: w.topic,
                payload: w.payload,
                qos: w.qos,
                retain: w.retain,
            });
            s.bind_writer(writer.clone());
            s.touch();

            // CONNACK and replay go through the writer while the session lock
            // is held, so replayed in-flight messages reach the socket before
            // any publication routed concurrently by a peer.
            let _ = writer.send_packet(&Packet::ConnAck(ConnAck {
                session_present: resumed,
                return_code: ConnectReturnCode::Accepted,
            }));
            s.resend();
        }

        self.writer = Some(writer);
        self.state = State::Connected {
            client_id: client_id.clone(),
            session,
        };

        debug!("CONNACK sent to {} (session_present: {})", client_id, resumed);
        Ok(())
    }
}
