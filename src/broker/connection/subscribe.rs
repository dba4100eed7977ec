//! SUBSCRIBE and UNSUBSCRIBE packet handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, SubAck, Subscribe, UnsubAck, Unsubscribe};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE: register with the engine and echo its granted-QoS
    /// vector in SUBACK with the same packet id [MQTT-2.3.1-7].
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let return_codes = self.engine.subscribe(client_id, &subscribe.topics);

        for (topic, code) in subscribe.topics.iter().zip(return_codes.iter()) {
            debug!(
                "SUBSCRIBE {} to {} -> {:?}",
                client_id, topic.filter, code
            );
        }

        self.respond(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await
    }

    /// Handle UNSUBSCRIBE: forward to the engine and reply UNSUBACK
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        self.engine.unsubscribe(client_id, &unsubscribe.filters);

        for filter in &unsubscribe.filters {
            debug!("UNSUBSCRIBE {} from {}", client_id, filter);
        }

        self.respond(&Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
        }))
        .await
    }
}
