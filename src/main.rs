//! VibeMQ - MQTT v3.1/v3.1.1/v5 connect-handshake broker
//!
//! Usage:
//!   vibemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   -w, --workers <N>      Number of worker threads (default: CPU count)
//!   --max-connections <N>  Maximum connections (default: 100000)
//!   --max-packet-size <N>  Maximum packet size (default: 1MB)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vibemq::auth::AuthProvider;
use vibemq::broker::{Broker, BrokerConfig};
use vibemq::config::Config;
use vibemq::hooks::CompositeHooks;
use vibemq::persistence::{FjallBackend, PersistenceManager};
use vibemq::protocol::QoS;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
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

/// VibeMQ - MQTT broker
#[derive(Parser, Debug)]
#[command(name = "vibemq")]
#[command(author = "VibeMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "MQTT v3.1/v3.1.1/v5 connect-handshake broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of worker threads (0 = auto)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Maximum packet size in bytes
    #[arg(long)]
    max_packet_size: Option<usize>,

    /// Maximum QoS level (0, 1, or 2)
    #[arg(long)]
    max_qos: Option<u8>,

    /// Default keep alive in seconds
    #[arg(long)]
    keep_alive: Option<u16>,

    /// Enable retained messages
    #[arg(long)]
    retain: Option<bool>,

    /// Enable wildcard subscriptions
    #[arg(long)]
    wildcard_subs: Option<bool>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use env vars + defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::from_env().unwrap_or_default()
    };

    // Setup logging - CLI overrides config, config overrides default (warn)
    let log_level = args.log_level.unwrap_or_else(|| {
        match file_config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(config_path) = &args.config {
        info!("Loaded configuration from {:?}", config_path);
    }

    // CLI args override file config
    let bind_addr = args.bind.unwrap_or(file_config.server.bind);
    let max_connections = args
        .max_connections
        .unwrap_or(file_config.limits.max_connections);
    let max_connections = if max_connections == 0 {
        10_000_000
    } else {
        max_connections
    };
    let max_packet_size = args
        .max_packet_size
        .unwrap_or(file_config.limits.max_packet_size);
    let max_packet_size = if max_packet_size == 0 {
        usize::MAX
    } else {
        max_packet_size
    };
    let default_keep_alive = args
        .keep_alive
        .unwrap_or(file_config.session.default_keep_alive);
    let max_keep_alive = file_config.session.max_keep_alive;
    let retain_available = args.retain.unwrap_or(file_config.mqtt.retain_available);
    let wildcard_subs = args
        .wildcard_subs
        .unwrap_or(file_config.mqtt.wildcard_subscriptions);

    // Parse max QoS
    let max_qos_value = args.max_qos.unwrap_or(file_config.mqtt.max_qos);
    let max_qos = match max_qos_value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            eprintln!(
                "Invalid max-qos value: {}. Must be 0, 1, or 2.",
                max_qos_value
            );
            std::process::exit(1);
        }
    };

    // Determine worker count
    let workers = args.workers.unwrap_or(file_config.server.workers);
    let num_workers = if workers == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    } else {
        workers
    };

    // Build broker configuration
    let broker_config = BrokerConfig {
        bind_addr,
        max_connections,
        max_packet_size,
        default_keep_alive,
        max_keep_alive,
        max_qos,
        retain_available,
        wildcard_subscription_available: wildcard_subs,
        max_topic_levels: file_config.mqtt.max_topic_levels,
        allow_zero_byte_client_id: file_config.mqtt.allow_zero_byte_client_id,
        immediate_buffer_flush: file_config.limits.immediate_buffer_flush,
        inflight_resend_interval: file_config.limits.retry_interval_duration(),
        max_queued_messages: if file_config.limits.max_queued_messages == 0 {
            usize::MAX
        } else {
            file_config.limits.max_queued_messages
        },
        num_workers,
    };

    info!("Starting VibeMQ MQTT broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Workers: {}", broker_config.num_workers);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!(
        "  Max queued messages: {}",
        broker_config.max_queued_messages
    );
    info!("  Max QoS: {:?}", broker_config.max_qos);

    if file_config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            file_config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }

    // Compose hooks: auth is the only hook implementation carried today, but
    // the broker always runs through CompositeHooks so additional hook
    // implementations can be added without touching the connection code.
    let auth_provider = AuthProvider::new(&file_config.auth);
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider));

    // Create broker with hooks
    let broker = Arc::new(Broker::with_hooks(broker_config, hooks));

    // Initialize persistence if enabled
    let persistence_manager = if file_config.persistence.enabled {
        info!(
            "  Persistence: enabled ({:?})",
            file_config.persistence.path
        );

        let backend = match FjallBackend::open(&file_config.persistence.path) {
            Ok(b) => Arc::new(b),
            Err(e) => {
                eprintln!("Error opening persistence backend: {}", e);
                std::process::exit(1);
            }
        };

        let manager = Arc::new(PersistenceManager::new(
            backend,
            file_config.persistence.flush_interval(),
            file_config.persistence.max_batch_size,
        ));

        let loaded = match manager.load_all().await {
            Ok(data) => data,
            Err(e) => {
                eprintln!("Error loading persistence data: {}", e);
                std::process::exit(1);
            }
        };

        info!(
            "  Loaded: {} retained messages, {} sessions",
            loaded.retained.len(),
            loaded.sessions.len()
        );

        for (_, stored) in loaded.retained {
            broker.restore_retained(stored.into());
        }
        for (_, stored) in loaded.sessions {
            broker.sessions().restore(stored.into_session());
        }

        broker.set_persistence(manager.clone()).await;

        Some(manager)
    } else {
        info!("  Persistence: disabled");
        None
    };

    // Setup metrics if configured
    if file_config.metrics.enabled {
        let metrics = Arc::new(vibemq::Metrics::new());
        broker.set_metrics(metrics.clone()).await;
        info!("  Metrics: enabled (http://{})", file_config.metrics.bind);

        let metrics_server = vibemq::MetricsServer::new(metrics, file_config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                tracing::error!("Metrics server error: {}", e);
            }
        });
    } else {
        info!("  Metrics: disabled");
    }

    // Run the broker until Ctrl+C or an internal shutdown signal fires.
    let broker_handle = broker.clone();
    let result = tokio::select! {
        res = broker_handle.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            broker.shutdown();
            Ok(())
        }
    };

    // Shutdown persistence (flush pending writes)
    if let Some(persistence) = persistence_manager {
        info!("Flushing persistence...");
        if let Err(e) = persistence.shutdown().await {
            tracing::error!("Error during persistence shutdown: {}", e);
        }
    }

    result?;
    Ok(())
}
