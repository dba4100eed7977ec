//! Message delivery engine
//!
//! The component between the per-connection protocol handlers and the rest of
//! the broker's shared state: the session registry, the subscription store,
//! and the retained-message map. Connection handlers hand it decoded
//! operations (connect, subscribe, publish, terminate) and it routes
//! publications into the target sessions via
//! [`crate::session::Session::publish_arrived`].

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::protocol::{QoS, SubAckReturnCode, SubscribeTopic};
use crate::session::{Session, SessionOptions, SessionStore};
use crate::topic::{
    topic_matches_filter, validate_topic_filter, Subscription, SubscriptionStore,
};

/// A retained message, one per topic
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Routes publications to subscriber sessions and owns the cross-session
/// shared state.
pub struct DeliveryEngine {
    sessions: SessionStore,
    subscriptions: SubscriptionStore,
    retained: DashMap<String, RetainedMessage>,
    /// Deliver one copy per client when several overlapping subscriptions
    /// match, keeping the highest subscription QoS
    overlapping_single: bool,
    session_opts: SessionOptions,
}

impl DeliveryEngine {
    pub fn new(overlapping_single: bool, session_opts: SessionOptions) -> Self {
        Self {
            sessions: SessionStore::new(),
            subscriptions: SubscriptionStore::new(),
            retained: DashMap::new(),
            overlapping_single,
            session_opts,
        }
    }

    /// The session registry (the keepalive sweeper scans it)
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Retrieve a session by client id
    pub fn get_client(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id)
    }

    /// Register a connecting client. With clean_session=true any previous
    /// session state and subscriptions are discarded; otherwise retained
    /// state is resumed. Returns (session, resumed).
    pub fn connect(
        &self,
        client_id: &str,
        clean_session: bool,
    ) -> (Arc<RwLock<Session>>, bool) {
        if clean_session {
            self.subscriptions.unsubscribe_all(client_id);
        }
        self.sessions
            .get_or_create(client_id, clean_session, self.session_opts)
    }

    /// A client went away without terminating. Clean sessions are discarded;
    /// persistent sessions are kept for a later resume.
    pub fn disconnect(&self, client_id: &str) {
        let discard = self
            .sessions
            .get(client_id)
            .is_some_and(|session| session.read().clean_session);

        if discard {
            self.sessions.remove(client_id);
            self.subscriptions.unsubscribe_all(client_id);
        }
    }

    /// Terminate a client: publish its will (if any) and discard all session
    /// state regardless of the clean-session flag.
    pub fn terminate(&self, client_id: &str) {
        let will = self
            .sessions
            .get(client_id)
            .and_then(|session| session.write().take_will());

        self.sessions.remove(client_id);
        self.subscriptions.unsubscribe_all(client_id);

        if let Some(will) = will {
            debug!("publishing will message for {} to {}", client_id, will.topic);
            self.publish(client_id, &will.topic, will.payload, will.qos, will.retain);
        }
    }

    /// Register subscriptions and return the granted-QoS vector echoed in
    /// SUBACK. Invalid filters are granted the failure code. Matching
    /// retained messages are delivered to the subscriber.
    pub fn subscribe(&self, client_id: &str, topics: &[SubscribeTopic]) -> Vec<SubAckReturnCode> {
        let mut granted = Vec::with_capacity(topics.len());

        for topic in topics {
            if let Err(e) = validate_topic_filter(&topic.filter) {
                warn!(
                    "rejecting subscription of {} to {:?}: {}",
                    client_id, topic.filter, e
                );
                granted.push(SubAckReturnCode::Failure);
                continue;
            }

            self.subscriptions.subscribe(
                &topic.filter,
                Subscription {
                    client_id: client_id.into(),
                    qos: topic.qos,
                },
            );
            granted.push(topic.qos.into());

            self.deliver_retained(client_id, &topic.filter, topic.qos);
        }

        granted
    }

    /// Remove subscriptions
    pub fn unsubscribe(&self, client_id: &str, filters: &[String]) {
        for filter in filters {
            self.subscriptions.unsubscribe(filter, client_id);
        }
    }

    /// Route a publication to every matching subscriber session. Retained
    /// publications are stored first (an empty retained payload clears the
    /// topic [MQTT-3.3.1-10]); the retain flag is cleared on normal
    /// forwarding [MQTT-3.3.1-9].
    pub fn publish(&self, origin: &str, topic: &str, payload: Bytes, qos: QoS, retain: bool) {
        trace!(
            "publish from {} to {} (QoS {:?}, retain {})",
            origin,
            topic,
            qos,
            retain
        );

        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(
                    topic.to_string(),
                    RetainedMessage {
                        topic: Arc::from(topic),
                        payload: payload.clone(),
                        qos,
                    },
                );
            }
        }

        let matches = self.subscriptions.matches(topic);
        let topic: Arc<str> = Arc::from(topic);

        if self.overlapping_single {
            // One copy per client, highest matching subscription QoS wins
            let mut client_qos: AHashMap<Arc<str>, QoS> = AHashMap::with_capacity(matches.len());
            for sub in &matches {
                let entry = client_qos
                    .entry(sub.client_id.clone())
                    .or_insert(QoS::AtMostOnce);
                if sub.qos > *entry {
                    *entry = sub.qos;
                }
            }

            for (client_id, sub_qos) in client_qos {
                self.deliver(&client_id, &topic, &payload, qos.min(sub_qos));
            }
        } else {
            for sub in &matches {
                self.deliver(&sub.client_id, &topic, &payload, qos.min(sub.qos));
            }
        }
    }

    fn deliver(&self, client_id: &str, topic: &Arc<str>, payload: &Bytes, qos: QoS) {
        if let Some(session) = self.sessions.get(client_id) {
            session
                .write()
                .publish_arrived(topic.clone(), payload.clone(), qos, false);
        }
    }

    fn deliver_retained(&self, client_id: &str, filter: &str, qos: QoS) {
        let Some(session) = self.sessions.get(client_id) else {
            return;
        };

        let matching: Vec<RetainedMessage> = self
            .retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect();

        for msg in matching {
            // Deliveries that exist because of retention carry the retain
            // flag [MQTT-3.3.1-8]
            session
                .write()
                .publish_arrived(msg.topic.clone(), msg.payload.clone(), msg.qos.min(qos), true);
        }
    }

    /// Number of retained messages
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ClientWriter;
    use crate::codec::Decoder;
    use crate::protocol::Packet;

    fn engine(overlapping_single: bool) -> DeliveryEngine {
        DeliveryEngine::new(overlapping_single, SessionOptions::default())
    }

    fn attach(engine: &DeliveryEngine, client_id: &str) -> Arc<ClientWriter> {
        let (session, _) = engine.connect(client_id, true);
        let writer = Arc::new(ClientWriter::new());
        session.write().bind_writer(writer.clone());
        writer
    }

    fn drain(writer: &ClientWriter) -> Vec<Packet> {
        let buf = writer.take_buffer();
        let mut decoder = Decoder::new();
        let mut packets = Vec::new();
        let mut pos = 0;
        while let Some((packet, consumed)) = decoder.decode(&buf[pos..]).unwrap() {
            packets.push(packet);
            pos += consumed;
        }
        packets
    }

    fn topics(filter: &str, qos: QoS) -> Vec<SubscribeTopic> {
        vec![SubscribeTopic {
            filter: filter.to_string(),
            qos,
        }]
    }

    #[test]
    fn routes_to_matching_subscriber() {
        let engine = engine(true);
        let writer = attach(&engine, "a");
        engine.subscribe("a", &topics("x/+", QoS::AtMostOnce));

        engine.publish("b", "x/y", Bytes::from("hi"), QoS::AtMostOnce, false);

        let sent = drain(&writer);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Publish(p) => {
                assert_eq!(p.topic.as_ref(), "x/y");
                assert_eq!(p.payload, Bytes::from("hi"));
                assert!(!p.retain);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn overlapping_single_delivers_once_at_highest_qos() {
        let engine = engine(true);
        let writer = attach(&engine, "a");
        engine.subscribe("a", &topics("x/#", QoS::AtMostOnce));
        engine.subscribe("a", &topics("x/y", QoS::AtLeastOnce));

        engine.publish("b", "x/y", Bytes::from("m"), QoS::AtLeastOnce, false);

        let sent = drain(&writer);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Publish(p) => assert_eq!(p.qos, QoS::AtLeastOnce),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn overlapping_multi_delivers_per_subscription() {
        let engine = engine(false);
        let writer = attach(&engine, "a");
        engine.subscribe("a", &topics("x/#", QoS::AtMostOnce));
        engine.subscribe("a", &topics("x/y", QoS::AtMostOnce));

        engine.publish("b", "x/y", Bytes::from("m"), QoS::AtMostOnce, false);

        assert_eq!(drain(&writer).len(), 2);
    }

    #[test]
    fn effective_qos_is_minimum() {
        let engine = engine(true);
        let writer = attach(&engine, "a");
        engine.subscribe("a", &topics("t", QoS::ExactlyOnce));

        engine.publish("b", "t", Bytes::from("m"), QoS::AtLeastOnce, false);

        match &drain(&writer)[0] {
            Packet::Publish(p) => assert_eq!(p.qos, QoS::AtLeastOnce),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn retained_delivered_on_subscribe() {
        let engine = engine(true);
        engine.publish("b", "r/t", Bytes::from("keep"), QoS::AtLeastOnce, true);

        let writer = attach(&engine, "a");
        engine.subscribe("a", &topics("r/#", QoS::AtMostOnce));

        let sent = drain(&writer);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Publish(p) => {
                assert!(p.retain);
                // capped by the subscription QoS
                assert_eq!(p.qos, QoS::AtMostOnce);
            }
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn empty_retained_payload_clears() {
        let engine = engine(true);
        engine.publish("b", "r/t", Bytes::from("keep"), QoS::AtMostOnce, true);
        assert_eq!(engine.retained_count(), 1);

        engine.publish("b", "r/t", Bytes::new(), QoS::AtMostOnce, true);
        assert_eq!(engine.retained_count(), 0);
    }

    #[test]
    fn invalid_filter_gets_failure_code() {
        let engine = engine(true);
        attach(&engine, "a");

        let granted = engine.subscribe("a", &topics("a/#/b", QoS::AtMostOnce));
        assert_eq!(granted, vec![SubAckReturnCode::Failure]);
    }

    #[test]
    fn terminate_publishes_will_and_discards() {
        let engine = engine(true);
        let subscriber = attach(&engine, "a");
        engine.subscribe("a", &topics("wills/#", QoS::AtMostOnce));

        let (session, _) = engine.connect("b", false);
        session.write().will = Some(crate::session::WillMessage {
            topic: "wills/b".to_string(),
            payload: Bytes::from("gone"),
            qos: QoS::AtMostOnce,
            retain: false,
        });

        engine.terminate("b");

        let sent = drain(&subscriber);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Publish(p) => assert_eq!(p.payload, Bytes::from("gone")),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
        // session state is gone even though clean_session was false
        assert!(engine.get_client("b").is_none());
    }

    #[test]
    fn disconnect_keeps_persistent_session() {
        let engine = engine(true);
        let (_, _) = engine.connect("p", false);

        engine.disconnect("p");
        assert!(engine.get_client("p").is_some());

        let (_, _) = engine.connect("c", true);
        engine.disconnect("c");
        assert!(engine.get_client("c").is_none());
    }

    #[test]
    fn qos1_queued_for_disconnected_persistent_session() {
        let engine = engine(true);
        let (session, _) = engine.connect("p", false);
        engine.subscribe("p", &topics("t", QoS::AtLeastOnce));

        // no writer bound: the session is disconnected
        engine.publish("b", "t", Bytes::from("m"), QoS::AtLeastOnce, false);
        assert_eq!(session.read().inflight_len(), 1);

        // QoS 0 is dropped for disconnected sessions by default
        engine.publish("b", "t", Bytes::from("m0"), QoS::AtMostOnce, false);

        // on reconnect only the QoS 1 publication is replayed
        let writer = Arc::new(ClientWriter::new());
        {
            let mut s = session.write();
            s.bind_writer(writer.clone());
            s.resend();
        }
        let sent = drain(&writer);
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Publish(p) => assert_eq!(p.payload, Bytes::from("m")),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}
