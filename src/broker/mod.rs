//! MQTT broker core
//!
//! The TCP listener, the per-connection protocol handlers, and the keepalive
//! sweeper that terminates silent clients.

mod connection;
mod writer;

pub use connection::{Connection, ConnectionError};
pub use writer::{ClientWriter, CloseReason, SendError};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::engine::DeliveryEngine;
use crate::session::SessionOptions;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP bind address
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size
    pub max_packet_size: usize,
    /// How often the keepalive sweeper scans for silent clients
    pub sweep_interval: Duration,
    /// Withhold inbound QoS 2 publications until PUBREL arrives
    pub publish_on_pubrel: bool,
    /// Deliver one copy per client on overlapping subscriptions
    pub overlapping_single: bool,
    /// Drop QoS 0 publications destined for a disconnected session
    pub drop_qos0: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1883".parse().unwrap(),
            max_connections: 100_000,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            sweep_interval: Duration::from_secs(1),
            publish_on_pubrel: true,
            overlapping_single: true,
            drop_qos0: true,
        }
    }
}

/// The MQTT broker
pub struct Broker {
    config: BrokerConfig,
    engine: Arc<DeliveryEngine>,
    /// Connection tasks currently alive
    active: Arc<AtomicUsize>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let session_opts = SessionOptions {
            publish_on_pubrel: config.publish_on_pubrel,
            drop_qos0: config.drop_qos0,
        };
        let engine = Arc::new(DeliveryEngine::new(config.overlapping_single, session_opts));

        info!("MQTT 3.1.1 broker");
        info!(
            "optional behaviour, publish on pubrel: {}",
            config.publish_on_pubrel
        );
        info!(
            "optional behaviour, single publish on overlapping topics: {}",
            config.overlapping_single
        );
        info!(
            "optional behaviour, drop QoS 0 publications to disconnected clients: {}",
            config.drop_qos0
        );

        Self {
            config,
            engine,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The delivery engine (exposed for embedding and tests)
    pub fn engine(&self) -> &Arc<DeliveryEngine> {
        &self.engine
    }

    /// Number of live connection tasks
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the broker: bind, start the keepalive sweeper, accept forever
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("MQTT/TCP listening on {}", self.config.bind_addr);

        self.spawn_keepalive_sweeper();

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("new TCP connection from {}", addr);
                    self.handle_connection(stream, addr);
                }
                Err(e) => {
                    error!("failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    /// Spawn a handler task for an accepted connection
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let _ = stream.set_nodelay(true);

        let engine = self.engine.clone();
        let config = self.config.clone();
        let active = self.active.clone();
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let mut conn = Connection::new(stream, addr, engine, config, active.clone());
            if let Err(e) = conn.run().await {
                debug!("connection from {} ended: {}", addr, e);
            }
            conn.return_buffers();
            active.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Periodically check every connected session's last-packet timestamp and
    /// cut off clients silent for longer than 1.5x their keepalive.
    fn spawn_keepalive_sweeper(&self) {
        let engine = self.engine.clone();
        let interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                engine.sessions().for_each(|session| {
                    let s = session.read();
                    if s.keep_alive_expired() {
                        info!(
                            "[MQTT-3.1.2-22] keepalive timeout for client {}",
                            s.client_id
                        );
                        if let Some(writer) = s.writer() {
                            writer.close(CloseReason::KeepAliveTimeout);
                        }
                    }
                });
            }
        });
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
