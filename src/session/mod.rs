//! MQTT session management
//!
//! Per-client protocol state: the ordered outbound in-flight list, the QoS 2
//! receive side, the packet identifier allocator, will message, and keepalive
//! bookkeeping. Sessions with clean_session=false survive disconnects and are
//! replayed on reconnect.
//!
//! All mutation happens under the session's `RwLock`; acknowledgment
//! inconsistencies (unknown id, wrong QoS, wrong handshake state) are logged
//! and recovered without touching state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::broker::ClientWriter;
use crate::protocol::{Packet, PubRel, Publish, QoS};

/// Broker behavior flags a session needs at creation time
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Withhold inbound QoS 2 publications until PUBREL arrives
    pub publish_on_pubrel: bool,
    /// Drop QoS 0 publications destined for a disconnected session
    pub drop_qos0: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            publish_on_pubrel: true,
            drop_qos0: true,
        }
    }
}

/// QoS 2 outbound handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    AwaitingPubrec,
    /// PUBREC received, PUBREL sent, waiting for PUBCOMP
    AwaitingPubcomp,
}

/// An unacknowledged outbound QoS 1/2 publication
#[derive(Debug, Clone)]
pub struct InflightMessage {
    /// Packet identifier
    pub packet_id: u16,
    /// The publish packet
    pub publish: Publish,
    /// QoS 2 handshake state (None for QoS 1)
    pub qos2_state: Option<Qos2State>,
}

/// Slot in the ordered send list. QoS 1/2 bodies live in the in-flight map;
/// QoS 0 publications are held inline, and only while the session is
/// disconnected.
#[derive(Debug)]
enum SendSlot {
    Inflight(u16),
    QosZero(Publish),
}

/// QoS 2 receive-side state. The representation is fixed at session creation
/// from `publish_on_pubrel`: either the full publication is held back until
/// PUBREL, or only the identifier is remembered for deduplication because the
/// publication was already forwarded.
#[derive(Debug)]
pub enum InboundQos2 {
    Held(HashMap<u16, Publish>),
    Forwarded(HashSet<u16>),
}

impl InboundQos2 {
    pub fn contains(&self, packet_id: u16) -> bool {
        match self {
            Self::Held(map) => map.contains_key(&packet_id),
            Self::Forwarded(set) => set.contains(&packet_id),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Held(map) => map.len(),
            Self::Forwarded(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of releasing an inbound QoS 2 identifier
#[derive(Debug)]
pub enum PubrelOutcome {
    /// The withheld publication; the caller forwards it to the engine
    Deliver(Publish),
    /// Identifier known and cleared; the publication was forwarded earlier
    Acknowledge,
    /// Identifier unknown; PUBCOMP is still owed to the sender
    Unknown,
}

/// Will message recorded at CONNECT
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Clean session flag from the latest CONNECT
    pub clean_session: bool,
    /// Keep alive interval in seconds (0 disables)
    pub keep_alive: u16,
    /// Will message to publish on abnormal termination
    pub will: Option<WillMessage>,
    /// Timestamp of the last packet received from the client
    pub last_packet: Instant,
    /// Transport handle; present iff the client is connected
    writer: Option<Arc<ClientWriter>>,
    /// Next packet identifier
    next_packet_id: u16,
    /// Outbound publications in original send order
    send_order: VecDeque<SendSlot>,
    /// QoS 1/2 in-flight bodies indexed by packet identifier.
    /// Key set always equals the set of `Inflight` ids in `send_order`.
    inflight: HashMap<u16, InflightMessage>,
    /// QoS 2 receive-side state
    inbound: InboundQos2,
    opts: SessionOptions,
}

impl Session {
    pub fn new(client_id: Arc<str>, clean_session: bool, opts: SessionOptions) -> Self {
        Self {
            client_id,
            clean_session,
            keep_alive: 0,
            will: None,
            last_packet: Instant::now(),
            writer: None,
            next_packet_id: 1,
            send_order: VecDeque::new(),
            inflight: HashMap::new(),
            inbound: if opts.publish_on_pubrel {
                InboundQos2::Held(HashMap::new())
            } else {
                InboundQos2::Forwarded(HashSet::new())
            },
            opts,
        }
    }

    /// Whether a live transport is bound
    pub fn is_connected(&self) -> bool {
        self.writer.as_ref().is_some_and(|w| w.is_alive())
    }

    /// Bind the transport for a new connection (replaces any previous one)
    pub fn bind_writer(&mut self, writer: Arc<ClientWriter>) {
        self.writer = Some(writer);
    }

    /// Unbind the transport, but only if `writer` is still the bound one.
    /// Returns whether this call actually released it; a stale connection
    /// whose session was taken over must not touch the new binding.
    pub fn release_writer(&mut self, writer: &Arc<ClientWriter>) -> bool {
        match &self.writer {
            Some(current) if Arc::ptr_eq(current, writer) => {
                self.writer = None;
                true
            }
            _ => false,
        }
    }

    /// The currently bound transport, if any
    pub fn writer(&self) -> Option<Arc<ClientWriter>> {
        self.writer.clone()
    }

    /// Update the last-packet timestamp
    pub fn touch(&mut self) {
        self.last_packet = Instant::now();
    }

    /// Check the keepalive deadline. The server allows one and a half times
    /// the negotiated interval before declaring the client gone
    /// [MQTT-3.1.2-24].
    pub fn keep_alive_expired(&self) -> bool {
        if !self.is_connected() || self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        self.last_packet.elapsed() > timeout
    }

    pub fn publish_on_pubrel(&self) -> bool {
        self.opts.publish_on_pubrel
    }

    /// Allocate the next packet identifier: wraps 65535 -> 1, never 0, and
    /// skips identifiers still in flight.
    fn next_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);
            if self.next_packet_id == 0 {
                self.next_packet_id = 1;
            }

            if !self.inflight.contains_key(&id) {
                return id;
            }
        }
    }

    /// Enqueue an outbound publication to this client.
    ///
    /// QoS 1/2 publications get a fresh packet identifier and are tracked
    /// until acknowledged. QoS 0 publications are written through when
    /// connected; while disconnected they are queued only when the broker is
    /// configured to keep them.
    pub fn publish_arrived(&mut self, topic: Arc<str>, payload: Bytes, qos: QoS, retained: bool) {
        let mut publish = Publish {
            dup: false,
            qos,
            retain: retained,
            topic,
            packet_id: None,
            payload,
        };

        match qos {
            QoS::AtMostOnce => {
                if self.is_connected() {
                    self.send(Packet::Publish(publish));
                } else if !self.opts.drop_qos0 {
                    self.send_order.push_back(SendSlot::QosZero(publish));
                } else {
                    trace!(
                        client_id = %self.client_id,
                        "dropping QoS 0 publication for disconnected session"
                    );
                }
            }
            QoS::AtLeastOnce | QoS::ExactlyOnce => {
                let packet_id = self.next_packet_id();
                publish.packet_id = Some(packet_id);
                self.inflight.insert(
                    packet_id,
                    InflightMessage {
                        packet_id,
                        publish: publish.clone(),
                        qos2_state: (qos == QoS::ExactlyOnce).then_some(Qos2State::AwaitingPubrec),
                    },
                );
                self.send_order.push_back(SendSlot::Inflight(packet_id));

                if self.is_connected() {
                    self.send(Packet::Publish(publish));
                }
            }
        }
    }

    /// Complete a QoS 1 delivery
    pub fn puback(&mut self, packet_id: u16) {
        match self.inflight.get(&packet_id).map(|m| m.publish.qos) {
            Some(QoS::AtLeastOnce) => {
                self.inflight.remove(&packet_id);
                self.remove_slot(packet_id);
            }
            Some(qos) => {
                error!(
                    client_id = %self.client_id,
                    "PUBACK received for packet id {}, but QoS is {:?}", packet_id, qos
                );
            }
            None => {
                error!(
                    client_id = %self.client_id,
                    "PUBACK received for packet id {}, but no message found", packet_id
                );
            }
        }
    }

    /// First half of the QoS 2 outbound handshake.
    /// Returns true when a PUBREL should be sent in response.
    pub fn pubrec(&mut self, packet_id: u16) -> bool {
        match self.inflight.get_mut(&packet_id) {
            Some(msg) if msg.publish.qos == QoS::ExactlyOnce => match msg.qos2_state {
                Some(Qos2State::AwaitingPubrec) => {
                    msg.qos2_state = Some(Qos2State::AwaitingPubcomp);
                    true
                }
                _ => {
                    error!(
                        client_id = %self.client_id,
                        "PUBREC received for packet id {}, but message in wrong state", packet_id
                    );
                    false
                }
            },
            Some(msg) => {
                error!(
                    client_id = %self.client_id,
                    "PUBREC received for packet id {}, but QoS is {:?}",
                    packet_id, msg.publish.qos
                );
                false
            }
            None => {
                error!(
                    client_id = %self.client_id,
                    "PUBREC received for packet id {}, but no message found", packet_id
                );
                false
            }
        }
    }

    /// Complete a QoS 2 outbound delivery
    pub fn pubcomp(&mut self, packet_id: u16) {
        match self
            .inflight
            .get(&packet_id)
            .map(|m| (m.publish.qos, m.qos2_state))
        {
            Some((QoS::ExactlyOnce, Some(Qos2State::AwaitingPubcomp))) => {
                self.inflight.remove(&packet_id);
                self.remove_slot(packet_id);
            }
            Some((QoS::ExactlyOnce, _)) => {
                error!(
                    client_id = %self.client_id,
                    "PUBCOMP received for packet id {}, but message in wrong state", packet_id
                );
            }
            Some((qos, _)) => {
                error!(
                    client_id = %self.client_id,
                    "PUBCOMP received for packet id {}, but QoS is {:?}", packet_id, qos
                );
            }
            None => {
                error!(
                    client_id = %self.client_id,
                    "PUBCOMP received for packet id {}, but no message found", packet_id
                );
            }
        }
    }

    /// Whether an inbound QoS 2 identifier is already pending
    pub fn inbound_contains(&self, packet_id: u16) -> bool {
        self.inbound.contains(packet_id)
    }

    /// Record an inbound QoS 2 publication. In held mode the whole packet is
    /// stored until PUBREL; in forwarded mode only the identifier is kept and
    /// the caller has already routed the publication.
    pub fn record_inbound(&mut self, packet_id: u16, publish: Publish) {
        match &mut self.inbound {
            InboundQos2::Held(map) => {
                map.insert(packet_id, publish);
            }
            InboundQos2::Forwarded(set) => {
                set.insert(packet_id);
            }
        }
    }

    /// Release an inbound QoS 2 identifier on PUBREL.
    /// The sender is owed a PUBCOMP in every case, including `Unknown`.
    pub fn pubrel(&mut self, packet_id: u16) -> PubrelOutcome {
        match &mut self.inbound {
            InboundQos2::Held(map) => match map.remove(&packet_id) {
                Some(publish) => PubrelOutcome::Deliver(publish),
                None => {
                    error!(
                        client_id = %self.client_id,
                        "PUBREL received for packet id {}, but no message found", packet_id
                    );
                    PubrelOutcome::Unknown
                }
            },
            InboundQos2::Forwarded(set) => {
                if set.remove(&packet_id) {
                    PubrelOutcome::Acknowledge
                } else {
                    error!(
                        client_id = %self.client_id,
                        "PUBREL received for packet id {}, but no message found", packet_id
                    );
                    PubrelOutcome::Unknown
                }
            }
        }
    }

    /// Replay unacknowledged publications in original send order
    /// [MQTT-4.4.0-1]. QoS 1 and QoS 2 awaiting PUBREC are re-sent as PUBLISH
    /// with DUP=1; QoS 2 awaiting PUBCOMP collapses to a PUBREL. QoS 0
    /// publications queued while disconnected are delivered once (no DUP) and
    /// dropped from the list.
    pub fn resend(&mut self) {
        let slots = std::mem::take(&mut self.send_order);
        for slot in slots {
            match slot {
                SendSlot::QosZero(publish) => {
                    self.send(Packet::Publish(publish));
                }
                SendSlot::Inflight(packet_id) => {
                    let Some(msg) = self.inflight.get_mut(&packet_id) else {
                        continue;
                    };
                    msg.publish.dup = true;
                    match msg.qos2_state {
                        None | Some(Qos2State::AwaitingPubrec) => {
                            let publish = msg.publish.clone();
                            self.send(Packet::Publish(publish));
                        }
                        Some(Qos2State::AwaitingPubcomp) => {
                            self.send(Packet::PubRel(PubRel::new(packet_id)));
                        }
                    }
                    self.send_order.push_back(SendSlot::Inflight(packet_id));
                }
            }
        }
    }

    /// Take the will for publication, leaving none behind
    pub fn take_will(&mut self) -> Option<WillMessage> {
        self.will.take()
    }

    /// Number of unacknowledged outbound publications
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    fn send(&self, packet: Packet) {
        if let Some(writer) = &self.writer {
            let _ = writer.send_packet(&packet);
        }
    }

    fn remove_slot(&mut self, packet_id: u16) {
        self.send_order
            .retain(|slot| !matches!(slot, SendSlot::Inflight(id) if *id == packet_id));
    }

    /// In-flight ids in send order, for tests and diagnostics
    pub fn inflight_order(&self) -> Vec<u16> {
        self.send_order
            .iter()
            .filter_map(|slot| match slot {
                SendSlot::Inflight(id) => Some(*id),
                SendSlot::QosZero(_) => None,
            })
            .collect()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let order_ids: HashSet<u16> = self.inflight_order().into_iter().collect();
        let inflight_ids: HashSet<u16> = self.inflight.keys().copied().collect();
        assert_eq!(order_ids, inflight_ids);
    }
}

/// Thread-safe session registry keyed by client id
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Get or create a session. With clean_session=true any previous state is
    /// replaced by a fresh session; otherwise an existing session is resumed.
    /// Returns (session, resumed).
    pub fn get_or_create(
        &self,
        client_id: &str,
        clean_session: bool,
        opts: SessionOptions,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_session {
            if let Some(session) = self.sessions.get(&client_id) {
                return (session.clone(), true);
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            clean_session,
            opts,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Get a session by client id
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Remove a session
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Visit every session (used by the keepalive sweeper)
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<RwLock<Session>>),
    {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
