//! End-to-end broker scenarios
//!
//! Each test runs a real broker on a loopback port and drives it with a
//! minimal MQTT client speaking the wire format directly, validating the
//! protocol flows of the v3.1.1 specification.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use wrenmq::broker::{Broker, BrokerConfig};
use wrenmq::codec::{Decoder, Encoder};
use wrenmq::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS,
    SubAck, SubAckReturnCode, Subscribe, SubscribeTopic, Will,
};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19300);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn test_config(port: u16) -> BrokerConfig {
    BrokerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
        max_connections: 100,
        max_packet_size: 1024 * 1024,
        sweep_interval: Duration::from_millis(100),
        publish_on_pubrel: true,
        overlapping_single: true,
        drop_qos0: true,
    }
}

async fn start_broker(config: BrokerConfig) -> SocketAddr {
    let addr = config.bind_addr;
    tokio::spawn(async move {
        let broker = Broker::new(config);
        let _ = broker.run().await;
    });
    // Give the broker time to bind
    tokio::time::sleep(Duration::from_millis(100)).await;
    addr
}

/// Minimal MQTT client for driving the broker in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::new(),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("failed to encode");
        self.stream.write_all(&buf).await.expect("failed to write");
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("failed to write");
    }

    /// Receive the next packet, or None if the broker closed the connection
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self
                .decoder
                .decode(&self.buf)
                .expect("broker sent a malformed packet")
            {
                use bytes::Buf;
                self.buf.advance(consumed);
                return Some(packet);
            }

            let mut chunk = vec![0u8; 4096];
            match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) => return None,
                Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                Ok(Err(_)) => return None,
                Err(_) => panic!("timed out waiting for a packet"),
            }
        }
    }

    /// Assert that nothing arrives within a short window
    async fn recv_nothing(&mut self) {
        assert!(self.buf.is_empty(), "unexpected buffered data");
        let mut chunk = vec![0u8; 4096];
        match timeout(Duration::from_millis(300), self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => panic!("connection closed unexpectedly"),
            Ok(Ok(n)) => panic!("unexpected data: {:02x?}", &chunk[..n]),
            Ok(Err(e)) => panic!("read error: {}", e),
            Err(_) => {} // timeout = silence, as expected
        }
    }

    /// Assert the broker closed the connection
    async fn expect_closed(&mut self) {
        let mut chunk = vec![0u8; 4096];
        match timeout(Duration::from_secs(5), self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => panic!("expected close, got data: {:02x?}", &chunk[..n]),
            Ok(Err(_)) => {}
            Err(_) => panic!("timed out waiting for close"),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.mqtt_connect_full(client_id, clean_session, 60, None)
            .await
    }

    async fn mqtt_connect_full(
        &mut self,
        client_id: &str,
        clean_session: bool,
        keep_alive: u16,
        will: Option<Will>,
    ) -> ConnAck {
        self.send(&Packet::Connect(Box::new(Connect {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive,
            username: None,
            password: None,
            will,
        })))
        .await;

        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            topics: vec![SubscribeTopic {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>) {
        self.send(&Packet::Publish(Publish {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id,
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;
    }

    async fn expect_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(p)) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

// ============================================================================
// Connection rules (MQTT-3.1)
// ============================================================================

#[tokio::test]
async fn connect_accepted() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("c1", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.send(&Packet::PingReq).await;
    client.expect_closed().await;
}

#[tokio::test]
async fn second_connect_is_protocol_violation() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    client
        .send(&Packet::Connect(Box::new(Connect {
            client_id: "c1".to_string(),
            ..Default::default()
        })))
        .await;
    client.expect_closed().await;
}

#[tokio::test]
async fn wrong_protocol_level_refused_with_code_1() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    // Hand-built CONNECT with protocol level 3
    client
        .send_raw(&[
            0x10, 0x0E, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x03, 0x02, 0x00, 0x3C, 0x00, 0x02,
            b'c', b'1',
        ])
        .await;

    match client.recv().await {
        Some(Packet::ConnAck(ack)) => {
            assert_eq!(
                ack.return_code,
                ConnectReturnCode::UnacceptableProtocolVersion
            );
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
    client.expect_closed().await;
}

#[tokio::test]
async fn empty_client_id_with_persistent_session_rejected() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("", false).await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    client.expect_closed().await;
}

#[tokio::test]
async fn duplicate_client_id_takeover() {
    let addr = start_broker(test_config(next_port())).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("c1", true).await;

    let mut second = TestClient::connect(addr).await;
    let connack = second.mqtt_connect("c1", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    // The old connection is shut down, without a CONNACK or any other packet
    first.expect_closed().await;
}

// ============================================================================
// QoS flows (MQTT-3.3 .. 3.7, 4.3)
// ============================================================================

#[tokio::test]
async fn qos0_happy_path() {
    let addr = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("a", true).await;
    let suback = subscriber.subscribe(1, "a/b", QoS::AtMostOnce).await;
    assert_eq!(suback.packet_id, 1);
    assert_eq!(suback.return_codes, vec![SubAckReturnCode::GrantedQoS0]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("a/b", b"x", QoS::AtMostOnce, None).await;

    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "a/b");
    assert_eq!(publish.payload, Bytes::from_static(b"x"));
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert_eq!(publish.packet_id, None);

    // No acks are exchanged at QoS 0
    publisher.recv_nothing().await;
}

#[tokio::test]
async fn qos1_delivery() {
    let addr = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("a", true).await;
    subscriber.subscribe(1, "a/b", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("a/b", b"y", QoS::AtLeastOnce, Some(7)).await;

    // The broker acknowledges the publisher with the same id
    match publisher.recv().await {
        Some(Packet::PubAck(ack)) => assert_eq!(ack.packet_id, 7),
        other => panic!("expected PUBACK, got {:?}", other),
    }

    // The subscriber gets a broker-assigned id
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert_eq!(publish.packet_id, Some(1));
    assert_eq!(publish.payload, Bytes::from_static(b"y"));

    subscriber.send(&Packet::PubAck(PubAck::new(1))).await;
    subscriber.recv_nothing().await;
}

#[tokio::test]
async fn qos2_withholds_until_pubrel() {
    let addr = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("a", true).await;
    subscriber.subscribe(1, "q2/t", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("q2/t", b"z", QoS::ExactlyOnce, Some(3)).await;

    match publisher.recv().await {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 3),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // Nothing is forwarded before PUBREL
    subscriber.recv_nothing().await;

    publisher.send(&Packet::PubRel(PubRel::new(3))).await;
    match publisher.recv().await {
        Some(Packet::PubComp(comp)) => assert_eq!(comp.packet_id, 3),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    // Forwarded exactly once at PUBREL time
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from_static(b"z"));
    subscriber.send(&Packet::PubRec(PubRec::new(1))).await;
    match subscriber.recv().await {
        Some(Packet::PubRel(rel)) => assert_eq!(rel.packet_id, 1),
        other => panic!("expected PUBREL, got {:?}", other),
    }
    subscriber.send(&Packet::PubComp(PubComp::new(1))).await;
    subscriber.recv_nothing().await;
}

#[tokio::test]
async fn qos2_redelivery_is_idempotent() {
    let addr = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("a", true).await;
    subscriber.subscribe(1, "q2/t", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("q2/t", b"z", QoS::ExactlyOnce, Some(3)).await;
    match publisher.recv().await {
        Some(Packet::PubRec(_)) => {}
        other => panic!("expected PUBREC, got {:?}", other),
    }

    // Redeliver with DUP=1 before PUBREL: answered with PUBREC again,
    // no duplicate forward
    publisher
        .send(&Packet::Publish(Publish {
            dup: true,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "q2/t".into(),
            packet_id: Some(3),
            payload: Bytes::from_static(b"z"),
        }))
        .await;
    match publisher.recv().await {
        Some(Packet::PubRec(rec)) => assert_eq!(rec.packet_id, 3),
        other => panic!("expected PUBREC, got {:?}", other),
    }

    subscriber.recv_nothing().await;

    publisher.send(&Packet::PubRel(PubRel::new(3))).await;
    match publisher.recv().await {
        Some(Packet::PubComp(_)) => {}
        other => panic!("expected PUBCOMP, got {:?}", other),
    }

    // Exactly one delivery
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.payload, Bytes::from_static(b"z"));
    subscriber.recv_nothing().await;
}

#[tokio::test]
async fn pubcomp_sent_even_for_unknown_pubrel() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    client.send(&Packet::PubRel(PubRel::new(99))).await;
    match client.recv().await {
        Some(Packet::PubComp(comp)) => assert_eq!(comp.packet_id, 99),
        other => panic!("expected PUBCOMP, got {:?}", other),
    }
}

#[tokio::test]
async fn wildcard_in_publish_topic_closes_connection() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", true).await;

    client.publish("a/+", b"x", QoS::AtMostOnce, None).await;
    client.expect_closed().await;
}

// ============================================================================
// Retained messages (MQTT-3.3.1)
// ============================================================================

#[tokio::test]
async fn retained_message_delivered_on_subscribe() {
    let addr = start_broker(test_config(next_port())).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher
        .send(&Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: true,
            topic: "r/t".into(),
            packet_id: None,
            payload: Bytes::from_static(b"keep"),
        }))
        .await;

    // Retained storage is applied before a new subscriber arrives
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("a", true).await;
    subscriber.subscribe(1, "r/#", QoS::AtMostOnce).await;

    let publish = subscriber.expect_publish().await;
    assert!(publish.retain);
    assert_eq!(publish.payload, Bytes::from_static(b"keep"));
}

// ============================================================================
// Session continuity (MQTT-3.1.2, 4.4)
// ============================================================================

#[tokio::test]
async fn session_resume_replays_inflight_with_dup() {
    let addr = start_broker(test_config(next_port())).await;

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("c1", false).await;
    assert!(!connack.session_present);
    subscriber.subscribe(1, "t", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("t", b"m", QoS::AtLeastOnce, Some(5)).await;

    // Receive but do not acknowledge, then disconnect cleanly
    let publish = subscriber.expect_publish().await;
    assert_eq!(publish.packet_id, Some(1));
    assert!(!publish.dup);
    subscriber.send(&Packet::Disconnect).await;
    drop(subscriber);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect with the same id: the in-flight publication is replayed with
    // its original identifier and DUP=1, before anything else
    let mut resumed = TestClient::connect(addr).await;
    let connack = resumed.mqtt_connect("c1", false).await;
    assert!(connack.session_present);

    let replayed = resumed.expect_publish().await;
    assert_eq!(replayed.packet_id, Some(1));
    assert!(replayed.dup);
    assert_eq!(replayed.payload, Bytes::from_static(b"m"));

    resumed.send(&Packet::PubAck(PubAck::new(1))).await;
    resumed.recv_nothing().await;
}

#[tokio::test]
async fn clean_session_discards_state() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("c1", false).await;
    client.subscribe(1, "t", QoS::AtLeastOnce).await;
    client.send(&Packet::Disconnect).await;
    drop(client);

    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnecting with clean_session=1 starts fresh
    let mut fresh = TestClient::connect(addr).await;
    let connack = fresh.mqtt_connect("c1", true).await;
    assert!(!connack.session_present);

    // The old subscription is gone
    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("b", true).await;
    publisher.publish("t", b"m", QoS::AtMostOnce, None).await;
    fresh.recv_nothing().await;
}

// ============================================================================
// Will messages (MQTT-3.1.2-8, 3.14)
// ============================================================================

fn test_will() -> Will {
    Will {
        topic: "wills/c1".to_string(),
        payload: Bytes::from_static(b"gone"),
        qos: QoS::AtMostOnce,
        retain: false,
    }
}

#[tokio::test]
async fn will_published_on_abnormal_disconnect() {
    let addr = start_broker(test_config(next_port())).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("w", true).await;
    watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

    let mut client = TestClient::connect(addr).await;
    client
        .mqtt_connect_full("c1", true, 60, Some(test_will()))
        .await;

    // TCP close without DISCONNECT
    drop(client);

    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "wills/c1");
    assert_eq!(publish.payload, Bytes::from_static(b"gone"));
}

#[tokio::test]
async fn will_suppressed_on_clean_disconnect() {
    let addr = start_broker(test_config(next_port())).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("w", true).await;
    watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

    let mut client = TestClient::connect(addr).await;
    client
        .mqtt_connect_full("c1", true, 60, Some(test_will()))
        .await;
    client.send(&Packet::Disconnect).await;
    drop(client);

    watcher.recv_nothing().await;
}

// ============================================================================
// Keepalive (MQTT-3.1.2-22)
// ============================================================================

#[tokio::test]
async fn keepalive_timeout_terminates_and_fires_will() {
    let addr = start_broker(test_config(next_port())).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("w", true).await;
    watcher.subscribe(1, "wills/#", QoS::AtMostOnce).await;

    let mut silent = TestClient::connect(addr).await;
    silent
        .mqtt_connect_full("c1", true, 1, Some(test_will()))
        .await;

    // Send nothing: the sweeper cuts the client off after 1.5x keepalive
    // and publishes the will
    let publish = watcher.expect_publish().await;
    assert_eq!(publish.topic.as_ref(), "wills/c1");

    silent.expect_closed().await;
}

#[tokio::test]
async fn pingreq_resets_keepalive() {
    let addr = start_broker(test_config(next_port())).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect_full("c1", true, 1, None).await;

    // Keep pinging past the 1.5s deadline; the connection must stay up
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        client.send(&Packet::PingReq).await;
        match client.recv().await {
            Some(Packet::PingResp) => {}
            other => panic!("expected PINGRESP, got {:?}", other),
        }
    }
}
