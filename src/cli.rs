// src/cli.rs
//
// Command-line front end: serve the bridge or run one-shot operations
// against the configured interfaces.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::io::socketcan::{RawSocketProvider, SocketProvider};
use crate::link_setup::{IpLinkConfigurator, LinkConfigurator};
use crate::listener::MessageListener;
use crate::logging::init_logging;
use crate::registry::InterfaceRegistry;
use crate::sender::{CanMessage, MessageSender};
use crate::service::BridgeService;
use crate::settings::{load_settings, save_settings, BridgeConfig};

/// SocketCAN bridge
#[derive(Parser, Debug)]
#[command(name = "canbridge")]
#[command(about = "Send, capture and supervise traffic on SocketCAN interfaces", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (TOML)
    #[arg(short, long, value_name = "FILE", global = true, env = "CANBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Comma separated CAN ports, overrides config and CAN_PORTS
    #[arg(long, value_name = "PORTS", value_delimiter = ',', global = true)]
    can_ports: Vec<String>,

    /// Log level or filter directives
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Run the bridge until interrupted
    Run,
    /// Send one frame
    Send {
        #[arg(short, long)]
        interface: String,
        /// Identifier, decimal or 0x-prefixed hex
        #[arg(long, value_parser = parse_can_id)]
        id: u32,
        /// Payload as hex, e.g. DEADBEEF
        #[arg(long, default_value = "")]
        data: String,
    },
    /// Capture traffic, then print the most recent messages as JSON
    Listen {
        #[arg(short, long)]
        interface: String,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
        #[arg(long, default_value_t = 20)]
        count: i64,
    },
    /// Initialize interfaces and print system status as JSON
    Status,
    /// List CAN links known to the OS
    List,
    /// Show link state
    State { interface: String },
    /// Configure and bring up a link
    Setup { interface: String },
    /// Bring a link down
    Teardown { interface: String },
    /// Cycle a link down and up
    Reset { interface: String },
    /// Print the effective configuration
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn parse_can_id(value: &str) -> std::result::Result<u32, String> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid CAN ID {:?}: {}", value, e))
}

fn parse_payload(value: &str) -> Result<Vec<u8>> {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.strip_prefix("0x").unwrap_or(&cleaned);
    hex::decode(cleaned).with_context(|| format!("invalid hex payload {:?}", value))
}

impl Cli {
    /// Apply command-line overrides on top of file and environment settings.
    fn apply_overrides(&self, config: &mut BridgeConfig) {
        if !self.can_ports.is_empty() {
            config.can_ports = self
                .can_ports
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
    }
}

/// Binary entry point.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_settings(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), ports = ?config.can_ports, "canbridge");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(execute(cli.command, config))
}

async fn execute(command: Command, config: BridgeConfig) -> Result<()> {
    let provider: Arc<dyn SocketProvider> = Arc::new(RawSocketProvider);
    let link = IpLinkConfigurator::new(config.link.clone());

    match command {
        Command::Run => serve(config, provider, Arc::new(link)).await,
        Command::Send {
            interface,
            id,
            data,
        } => send_once(config, provider, CanMessage::new(interface, id, parse_payload(&data)?)).await,
        Command::Listen {
            interface,
            seconds,
            count,
        } => {
            let listener = MessageListener::new(provider, config.listener.clone());
            listener.start_listening(&interface)?;
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let messages = listener.get_recent_messages(&interface, count)?;
            listener.shutdown().await?;
            print_json(&messages)
        }
        Command::Status => {
            let mut config = config;
            config.auto_setup = false;
            config.listener.listen_on_start = false;
            config.announce.enabled = false;
            config.status_interval_secs = 0;

            let service = BridgeService::new(config, provider, Arc::new(link));
            service.start().await?;
            let monitor = service.monitor().clone();
            let status = tokio::task::spawn_blocking(move || monitor.get_system_status()).await?;
            service.stop().await;
            print_json(&status)
        }
        Command::List => print_json(&link.list_available().await?),
        Command::State { interface } => print_json(&link.get_state(&interface).await?),
        Command::Setup { interface } => {
            let state = link.setup_with_retry(&interface, &config.link.params()).await?;
            print_json(&state)
        }
        Command::Teardown { interface } => Ok(link.teardown(&interface).await?),
        Command::Reset { interface } => Ok(link.reset(&interface).await?),
        Command::Config { output } => match output {
            Some(path) => {
                save_settings(&path, &config)?;
                info!(path = %path.display(), "configuration written");
                Ok(())
            }
            None => {
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
    }
}

async fn serve(
    config: BridgeConfig,
    provider: Arc<dyn SocketProvider>,
    link: Arc<dyn LinkConfigurator>,
) -> Result<()> {
    let service = BridgeService::new(config, provider, link);
    service.start().await?;

    wait_for_signal().await?;
    service.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to wait for Ctrl-C")?,
        _ = term.recv() => {}
    }
    info!("shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for Ctrl-C")?;
    info!("shutdown signal received");
    Ok(())
}

async fn send_once(
    config: BridgeConfig,
    provider: Arc<dyn SocketProvider>,
    message: CanMessage,
) -> Result<()> {
    let registry = Arc::new(InterfaceRegistry::new(
        config.can_ports.clone(),
        config.registry.clone(),
        provider,
    ));
    let sender = MessageSender::new(registry.clone());
    sender.validate(&message)?;

    let name = message.interface.clone();
    let init = registry.clone();
    tokio::task::spawn_blocking(move || init.initialize_single(&name)).await??;

    let result = sender.send(&message);
    registry.cleanup();
    let latency = result?;

    print_json(&serde_json::json!({
        "interface": message.interface,
        "id": format!("0x{:X}", message.id),
        "data": hex::encode_upper(&message.data),
        "latencyUs": latency.as_micros() as u64,
    }))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
