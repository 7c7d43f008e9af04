//! VisionSync - LAN sync bridge for host AI sessions
//!
//! Usage:
//!   visionsync [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>      Configuration file path
//!   -p, --port <N>           WebSocket port (default: 8765)
//!   --discovery-port <N>     HTTP discovery port (default: 8766)
//!   --service-name <NAME>    Name advertised via /discover
//!   --max-connections <N>    Maximum connected clients (default: 10)
//!   -l, --log-level          Log level (error, warn, info, debug, trace)
//!   -h, --help               Print help
//!
//! Standalone runs use a scripted in-process host task so connected
//! clients see live traffic without the editor.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use visionsync::config::Config;
use visionsync::host::stub::StubProvider;
use visionsync::service::SyncService;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
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

/// VisionSync - LAN sync bridge
#[derive(Parser, Debug)]
#[command(name = "visionsync")]
#[command(author = "VisionSync Contributors")]
#[command(version = "0.1.0")]
#[command(about = "LAN sync bridge mirroring a host AI session to spatial clients")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket port
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP discovery port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Service name advertised via /discover
    #[arg(long)]
    service_name: Option<String>,

    /// Maximum connected clients
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use env vars + defaults
    let mut config = if let Some(config_path) = &args.config {
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

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Some(port) = args.port {
        config.sync.port = port;
    }
    if let Some(discovery_port) = args.discovery_port {
        config.sync.discovery_port = discovery_port;
    }
    if let Some(service_name) = args.service_name {
        config.sync.service_name = service_name;
    }
    if let Some(max_connections) = args.max_connections {
        config.sync.max_connections = max_connections;
    }
    config.validate()?;

    info!("Starting VisionSync");
    info!("  Service name: {}", config.sync.service_name);
    info!("  WebSocket port: {}", config.sync.port);
    info!("  Discovery port: {}", config.sync.discovery_port);
    info!("  Max connections: {}", config.sync.max_connections);
    match config.sync.consecutive_mistake_limit {
        Some(limit) => info!("  Consecutive mistake limit: {}", limit),
        None => info!("  Consecutive mistake limit: unbounded"),
    }

    let service = Arc::new(SyncService::new(config));
    let provider = StubProvider::with_auto_reply();
    service.start(provider).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    service.stop().await;
    Ok(())
}
