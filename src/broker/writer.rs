//! Per-connection outbound write buffer.
//!
//! A `ClientWriter` is the transport handle a [`crate::session::Session`]
//! writes through. Any task (the owning connection, the delivery engine
//! routing on behalf of a peer, the keepalive sweeper) may append packets;
//! only the owning connection task drains the buffer to its socket, so
//! per-socket send order is append order.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::Packet;

/// Why a writer was closed from outside the owning connection task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A new CONNECT with the same client id took the session over
    Takeover,
    /// The keepalive sweeper declared the client gone
    KeepAliveTimeout,
}

/// Error when sending through a ClientWriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// Encoding error
    Encoding,
}

/// Shared outbound buffer for one connection
pub struct ClientWriter {
    /// Encoded bytes waiting to be written to the socket
    buffer: Mutex<BytesMut>,
    /// Notification when the buffer has new data or the writer was closed
    notify: Notify,
    /// Whether the connection is still accepting output
    alive: AtomicBool,
    /// Set once by the closer; read by the owning task to pick the teardown path
    close_reason: Mutex<Option<CloseReason>>,
    encoder: Encoder,
}

impl ClientWriter {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(2048)),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
            close_reason: Mutex::new(None),
            encoder: Encoder::new(),
        }
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Close the writer and wake the owning connection task
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// The reason the writer was closed, if it was
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Get the notify handle for the connection loop
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending data from the buffer
    pub fn take_buffer(&self) -> BytesMut {
        let mut buf = self.buffer.lock();
        buf.split()
    }

    /// Encode a packet into the buffer and wake the owning task
    pub fn send_packet(&self, packet: &Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut buffer = self.buffer.lock();
            let start_len = buffer.len();
            if self.encoder.encode(packet, &mut buffer).is_err() {
                buffer.truncate(start_len);
                return Err(SendError::Encoding);
            }
            start_len == 0
        };

        // Only notify on the empty->nonempty edge - coalesces bursts
        if was_empty {
            self.notify.notify_one();
        }

        Ok(())
    }
}

impl Default for ClientWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClientWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientWriter")
            .field("buffered", &self.buffer.lock().len())
            .field("alive", &self.is_alive())
            .finish()
    }
}
