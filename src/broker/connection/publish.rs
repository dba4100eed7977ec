//! PUBLISH packet handling

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{error, info, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::session::Session;
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle an inbound PUBLISH according to its QoS
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        publish: Publish,
    ) -> Result<(), ConnectionError> {
        // [MQTT-3.3.2-2] wildcards are not allowed in a topic name
        if validate_topic_name(&publish.topic).is_err() {
            error!(
                "[MQTT-3.3.2-2] invalid topic name {:?} in PUBLISH from {}",
                publish.topic, client_id
            );
            return Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(
                "wildcards not allowed in topic name",
            )));
        }

        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client_id,
            publish.topic,
            publish.qos
        );

        match publish.qos {
            QoS::AtMostOnce => {
                self.engine.publish(
                    client_id,
                    &publish.topic,
                    publish.payload,
                    publish.qos,
                    publish.retain,
                );
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = require_packet_id(&publish)?;
                self.engine.publish(
                    client_id,
                    &publish.topic,
                    publish.payload.clone(),
                    publish.qos,
                    publish.retain,
                );
                self.respond(&Packet::PubAck(PubAck::new(packet_id))).await
            }
            QoS::ExactlyOnce => {
                let packet_id = require_packet_id(&publish)?;

                // Deduplicate against the receive-side state. A resend of an
                // unreleased id must carry DUP=1 [MQTT-2.1.2-2].
                if session.read().inbound_contains(packet_id) {
                    if publish.dup {
                        info!("[MQTT-2.1.2-2] DUP flag is 1 on redelivery");
                    } else {
                        error!(
                            "[MQTT-2.1.2-2] duplicate QoS 2 message id {} found with DUP 0",
                            packet_id
                        );
                    }
                } else {
                    let forward_now = {
                        let mut s = session.write();
                        s.record_inbound(packet_id, publish.clone());
                        !s.publish_on_pubrel()
                    };
                    if forward_now {
                        self.engine.publish(
                            client_id,
                            &publish.topic,
                            publish.payload.clone(),
                            publish.qos,
                            publish.retain,
                        );
                    }
                }

                self.respond(&Packet::PubRec(PubRec::new(packet_id))).await
            }
        }
    }
}

fn require_packet_id(publish: &Publish) -> Result<u16, ConnectionError> {
    publish.packet_id.ok_or(ConnectionError::Protocol(
        ProtocolError::ProtocolViolation("PUBLISH with QoS > 0 requires a packet id"),
    ))
}
