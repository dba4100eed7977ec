//! QoS 2 acknowledgment handling (PUBREC, PUBREL)
//!
//! PUBACK and PUBCOMP need no reply and are delegated to the session
//! directly from the dispatcher.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubComp, PubRec, PubRel};
use crate::session::{PubrelOutcome, Session};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle PUBREC from the receiver of a QoS 2 publication: advance the
    /// handshake and answer with PUBREL.
    pub(crate) async fn handle_pubrec(
        &mut self,
        session: &Arc<RwLock<Session>>,
        pubrec: PubRec,
    ) -> Result<(), ConnectionError> {
        let send_pubrel = session.write().pubrec(pubrec.packet_id);
        if send_pubrel {
            self.respond(&Packet::PubRel(PubRel::new(pubrec.packet_id)))
                .await?;
        }
        Ok(())
    }

    /// Handle PUBREL from the sender of a QoS 2 publication: release the
    /// withheld message (or just clear the id) and answer with PUBCOMP
    /// regardless of whether the id was known [MQTT-3.6.4-1].
    pub(crate) async fn handle_pubrel(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        pubrel: PubRel,
    ) -> Result<(), ConnectionError> {
        let outcome = session.write().pubrel(pubrel.packet_id);

        match outcome {
            PubrelOutcome::Deliver(publish) => {
                self.engine.publish(
                    client_id,
                    &publish.topic,
                    publish.payload.clone(),
                    publish.qos,
                    publish.retain,
                );
            }
            PubrelOutcome::Acknowledge => {}
            PubrelOutcome::Unknown => {
                info!("[MQTT-3.6.4-1] must respond with a PUBCOMP packet");
            }
        }

        self.respond(&Packet::PubComp(PubComp::new(pubrel.packet_id)))
            .await
    }
}
