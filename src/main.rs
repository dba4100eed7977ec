//! WrenMQ - conformance-oriented MQTT v3.1.1 broker
//!
//! Usage:
//!   wrenmq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (TOML)
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use wrenmq::broker::Broker;
use wrenmq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// WrenMQ - conformance-oriented MQTT v3.1.1 broker
#[derive(Parser, Debug)]
#[command(name = "wrenmq")]
#[command(version)]
#[command(about = "Conformance-oriented MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Withhold inbound QoS 2 publications until PUBREL arrives
    #[arg(long)]
    publish_on_pubrel: Option<bool>,

    /// Deliver one copy per client on overlapping subscriptions
    #[arg(long)]
    overlapping_single: Option<bool>,

    /// Drop QoS 0 publications destined for disconnected clients
    #[arg(long)]
    drop_qos0: Option<bool>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load the configuration file if given, otherwise env vars + defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // CLI overrides config, config overrides default
    let log_level = args.log_level.unwrap_or({
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut broker_config = file_config.broker_config();
    if let Some(bind) = args.bind {
        broker_config.bind_addr = bind;
    }
    if let Some(max_connections) = args.max_connections {
        broker_config.max_connections = max_connections;
    }
    if let Some(max_packet_size) = args.max_packet_size {
        broker_config.max_packet_size = max_packet_size;
    }
    if let Some(publish_on_pubrel) = args.publish_on_pubrel {
        broker_config.publish_on_pubrel = publish_on_pubrel;
    }
    if let Some(overlapping_single) = args.overlapping_single {
        broker_config.overlapping_single = overlapping_single;
    }
    if let Some(drop_qos0) = args.drop_qos0 {
        broker_config.drop_qos0 = drop_qos0;
    }

    info!("starting wrenmq on {}", broker_config.bind_addr);

    let broker = Broker::new(broker_config);
    broker.run().await?;

    Ok(())
}
