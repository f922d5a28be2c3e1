//! matchbox-bridge: MATCHBOX roaster over BLE, served over WebSocket.
//!
//! Run with: `cargo run -- --log-level info`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use matchbox_bridge::{BleScanner, Bridge, Config, Console, Result, WebSocketServer};

/// Bridge between a MATCHBOX coffee roaster and WebSocket clients.
#[derive(Parser, Debug)]
#[command(name = "matchbox-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Mode>,

    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging level.
    #[arg(long, value_enum, default_value_t = LogLevel::Warning, global = true)]
    log_level: LogLevel,

    /// Host to bind (overrides config).
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind (overrides config).
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Device name prefix (overrides config).
    #[arg(long, global = true)]
    prefix: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Mode {
    /// Run the WebSocket bridge (default).
    Serve,
    /// Interactive console for bench testing.
    Dev,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    None,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
            Self::None => "off",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.directive())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;

    let scanner = BleScanner::new().await?;
    let bridge = Arc::new(Bridge::new(
        Arc::new(scanner),
        config.supervisor_config(),
    ));

    let supervisor = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.run().await }
    });

    let result = match args.command.unwrap_or(Mode::Serve) {
        Mode::Serve => serve(&config, bridge.clone()).await,
        Mode::Dev => dev(bridge.clone()).await,
    };
    if let Err(e) = &result {
        error!("{}", e);
    }

    bridge.shutdown().await;
    if let Err(e) = supervisor.await {
        error!("Supervisor task failed: {}", e);
    }
    info!("Application shutting down");

    result
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(prefix) = &args.prefix {
        config.device.name_prefix = prefix.clone();
    }
    config.validate()?;

    Ok(config)
}

async fn serve(config: &Config, bridge: Arc<Bridge>) -> Result<()> {
    let server = WebSocketServer::bind(&config.server.bind_address(), bridge).await?;
    let server = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    info!("Application stopped by user (Ctrl+C)");

    server.abort();
    Ok(())
}

async fn dev(bridge: Arc<Bridge>) -> Result<()> {
    let console = Console::new(bridge);
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut out = std::io::stdout();

    tokio::select! {
        result = console.run(input, &mut out) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}
