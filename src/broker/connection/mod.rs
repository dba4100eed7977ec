//! Per-connection protocol handler
//!
//! Owns one transport, decodes frames off it, and drives the protocol state
//! machine: a connection starts in `Connecting` (only CONNECT is legal) and
//! moves to `Connected`, after which packets are dispatched by tag. Outbound
//! traffic routed to this client by peers lands in the session's
//! [`ClientWriter`] and is flushed here, so one task owns all socket I/O.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::broker::{BrokerConfig, ClientWriter, CloseReason};
use crate::buffer_pool;
use crate::codec::{Decoder, Encoder};
use crate::engine::DeliveryEngine;
use crate::protocol::{Packet, ProtocolError};
use crate::session::Session;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
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

/// Connection state
pub(crate) enum State {
    /// Waiting for the CONNECT packet
    Connecting,
    /// CONNECT accepted, session bound
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

/// Connection handler, generic over the stream type
pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) engine: Arc<DeliveryEngine>,
    pub(crate) config: BrokerConfig,
    /// This connection's outbound buffer (created during CONNECT)
    pub(crate) writer: Option<Arc<ClientWriter>>,
    pub(crate) active: Arc<AtomicUsize>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        engine: Arc<DeliveryEngine>,
        config: BrokerConfig,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            stream,
            addr,
            state: State::Connecting,
            decoder: Decoder::new().with_max_packet_size(config.max_packet_size),
            encoder: Encoder::new(),
            read_buf: buffer_pool::get_buffer(),
            write_buf: buffer_pool::get_buffer(),
            engine,
            config,
            writer: None,
            active,
        }
    }

    /// Run the connection handler to completion
    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        // Wait for the CONNECT packet with a timeout
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

    /// Main loop after CONNECT: read and dispatch inbound packets, flush the
    /// outbound buffer, react to the writer being closed from outside.
    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            State::Connected { client_id, session } => (client_id.clone(), session.clone()),
            State::Connecting => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "not connected",
                )))
            }
        };
        let writer = match &self.writer {
            Some(writer) => writer.clone(),
            None => {
                return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "not connected",
                )))
            }
        };

        // Packets pipelined behind CONNECT may already sit in the read buffer
        if let Err(e) = self.drain_read_buf(&client_id, &session).await {
            return self.fail_packet(e, &client_id, &session);
        }

        loop {
            tokio::select! {
                biased;

                result = self.stream.read_buf(&mut self.read_buf) => {
                    match result {
                        Ok(0) => {
                            // Peer closed without DISCONNECT
                            debug!("connection closed from {}", self.addr);
                            self.abnormal_disconnect(&client_id, &session);
                            return Ok(());
                        }
                        Ok(_) => {
                            if let Err(e) = self.drain_read_buf(&client_id, &session).await {
                                return self.fail_packet(e, &client_id, &session);
                            }
                        }
                        Err(e) => {
                            debug!("read error from {}: {}", self.addr, e);
                            self.abnormal_disconnect(&client_id, &session);
                            return Err(e.into());
                        }
                    }
                }

                // Flush outbound traffic routed into the writer buffer
                _ = writer.notified() => {
                    let data = writer.take_buffer();
                    if !data.is_empty() {
                        if let Err(e) = self.stream.write_all(&data).await {
                            debug!("write error to {}: {}", self.addr, e);
                            self.abnormal_disconnect(&client_id, &session);
                            return Err(e.into());
                        }
                    }

                    if !writer.is_alive() {
                        match writer.close_reason() {
                            Some(CloseReason::Takeover) => {
                                // The new connection owns the session now;
                                // just close this socket.
                                debug!("connection for {} superseded", client_id);
                                return Err(ConnectionError::Shutdown);
                            }
                            _ => {
                                self.abnormal_disconnect(&client_id, &session);
                                return Err(ConnectionError::Timeout);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Decode and dispatch every complete packet in the read buffer
    async fn drain_read_buf(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    session.write().touch();
                    self.handle_packet(client_id, session, packet).await?;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!(
                        "[MQTT-2.0.0-1] badly formed MQTT packet from {}: {}",
                        client_id, e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Tear down after a packet-level failure and pass the error through.
    /// A clean DISCONNECT already did its own teardown.
    fn fail_packet(
        &mut self,
        e: ConnectionError,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        match &e {
            ConnectionError::Shutdown => {}
            _ => {
                error!("error handling packet from {}: {}", client_id, e);
                self.abnormal_disconnect(client_id, session);
            }
        }
        Err(e)
    }

    /// Dispatch one decoded packet
    async fn handle_packet(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet: Packet,
    ) -> Result<(), ConnectionError> {
        match packet {
            Packet::Connect(_) => {
                error!("[MQTT-3.1.0-2] second CONNECT packet from {}", client_id);
                Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                    "second CONNECT packet",
                )))
            }
            Packet::Publish(publish) => self.handle_publish(client_id, session, publish).await,
            Packet::PubAck(puback) => {
                session.write().puback(puback.packet_id);
                Ok(())
            }
            Packet::PubRec(pubrec) => self.handle_pubrec(session, pubrec).await,
            Packet::PubRel(pubrel) => self.handle_pubrel(client_id, session, pubrel).await,
            Packet::PubComp(pubcomp) => {
                session.write().pubcomp(pubcomp.packet_id);
                Ok(())
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(client_id, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(client_id, unsubscribe).await
            }
            Packet::PingReq => self.respond(&Packet::PingResp).await,
            Packet::Disconnect => {
                debug!("DISCONNECT from {}", client_id);
                self.clean_disconnect(client_id, session);
                Err(ConnectionError::Shutdown)
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                warn!(
                    "unexpected packet type {} from {}",
                    packet.packet_type(),
                    client_id
                );
                Ok(())
            }
        }
    }

    /// Write a reply packet directly to the socket
    pub(crate) async fn respond(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        self.encoder
            .encode(packet, &mut self.write_buf)
            .map_err(|e| ConnectionError::Protocol(e.into()))?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    /// Return buffers to the pool for reuse by other connections
    pub fn return_buffers(&mut self) {
        let read_buf = std::mem::take(&mut self.read_buf);
        let write_buf = std::mem::take(&mut self.write_buf);
        buffer_pool::put_buffer(read_buf);
        buffer_pool::put_buffer(write_buf);
    }
}

/// Generate a random client id suffix
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
