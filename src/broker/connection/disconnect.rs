//! Connection teardown paths
//!
//! Every teardown releases the writer binding only if this connection still
//! owns it; a connection whose session was taken over must not touch the
//! state now owned by its successor.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::Connection;
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Clean teardown on a DISCONNECT packet: the will is discarded
    /// [MQTT-3.14.4-3] and the session survives iff clean_session=0.
    pub(crate) fn clean_disconnect(&mut self, client_id: &str, session: &Arc<RwLock<Session>>) {
        let released = match &self.writer {
            Some(writer) => {
                let mut s = session.write();
                let released = s.release_writer(writer);
                if released {
                    s.will = None;
                }
                released
            }
            None => false,
        };

        if released {
            self.engine.disconnect(client_id);
            debug!("client {} disconnected", client_id);
        }
    }

    /// Abnormal teardown (peer closed, malformed frame, protocol violation,
    /// keepalive timeout): the will is published and all session state is
    /// discarded.
    pub(crate) fn abnormal_disconnect(&mut self, client_id: &str, session: &Arc<RwLock<Session>>) {
        let released = match &self.writer {
            Some(writer) => session.write().release_writer(writer),
            None => false,
        };

        if released {
            info!(
                "[MQTT-3.1.2-8] abnormal disconnect for {}, sending will message",
                client_id
            );
            self.engine.terminate(client_id);
        } else {
            debug!("stale connection for {} already superseded", client_id);
        }
    }
}
