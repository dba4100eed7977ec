//! WrenMQ - conformance-oriented MQTT v3.1.1 broker
//!
//! A small broker built around the per-connection protocol state machine:
//! QoS 0/1/2 handshakes, session continuity across reconnects with ordered
//! replay, duplicate-client-id takeover, keepalive sweeping, and will
//! delivery. The normative clause tags of the v3.1.1 specification appear
//! verbatim in log lines for conformance testing.

pub mod broker;
pub mod buffer_pool;
pub mod codec;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use engine::DeliveryEngine;
pub use protocol::QoS;
