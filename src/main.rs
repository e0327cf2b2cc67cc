//! Binary entrypoint for the meshsession CLI.
//!
//! Commands:
//! - `monitor [--port <path>] [--mock]` - connect and print session events until Ctrl-C
//! - `send [--to <node>] [--attempts <n>] [--interval <s>] <text>` - send one message and wait
//!   for its delivery outcome (exit code 0 when confirmed, 1 otherwise)
//! - `nodes` - list the persisted node table, most recently seen first
//! - `ports` - list serial ports that could host a radio
//! - `init` - write a starter `meshsession.toml`
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

use meshsession::config::Config;
use meshsession::meshtastic::{Destination, NodeId};
use meshsession::registry::{JsonNodeStore, MemoryNodeStore, NodeRegistry, NodeStore};
use meshsession::session::{SendOptions, Session, SessionEvent, SessionEvents, SessionHandle};
use meshsession::transport::{MockTransport, Transport};

#[derive(Parser)]
#[command(name = "meshsession")]
#[command(about = "Reliable session layer for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshsession.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the radio and print events until interrupted
    Monitor {
        /// Meshtastic device port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,

        /// Use a simulated radio instead of a serial device
        #[arg(long)]
        mock: bool,
    },
    /// Send a text message and wait for the delivery outcome
    Send {
        /// Meshtastic device port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,

        /// Destination: "broadcast", "!hex" or a node number
        #[arg(short, long)]
        to: Option<String>,

        /// Transmission attempts before giving up
        #[arg(short, long)]
        attempts: Option<u32>,

        /// Seconds between attempts
        #[arg(short, long)]
        interval: Option<u64>,

        /// Use a simulated radio instead of a serial device
        #[arg(long)]
        mock: bool,

        /// Message text
        text: String,
    },
    /// List nodes from the persisted node table
    Nodes,
    /// List serial ports
    Ports,
    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before a config exists; everything else tolerates a missing file
    let config = match cli.command {
        Commands::Init => None,
        _ => match Config::load(&cli.config).await {
            Ok(c) => Some(c),
            Err(e) => {
                if std::path::Path::new(&cli.config).exists() {
                    return Err(e);
                }
                None
            }
        },
    };
    init_logging(&config, cli.verbose);
    if config.is_none() && !matches!(cli.command, Commands::Init) {
        warn!("{} not found, using built-in defaults", cli.config);
    }
    let config = config.unwrap_or_default();

    match cli.command {
        Commands::Monitor { port, mock } => {
            info!("Starting meshsession v{}", env!("CARGO_PKG_VERSION"));
            if mock {
                monitor(&config, mock_radio()).await?;
            } else {
                let port = port.unwrap_or_else(|| config.device.port.clone());
                monitor(&config, serial_transport(&port, config.device.baud_rate)?).await?;
            }
        }
        Commands::Send {
            port,
            to,
            attempts,
            interval,
            mock,
            text,
        } => {
            let destination = match to {
                Some(t) => t.parse::<Destination>().map_err(|e| anyhow!(e))?,
                None => config.delivery.destination()?,
            };
            let options = SendOptions {
                channel: None,
                max_attempts: attempts,
                retry_interval: interval.map(Duration::from_secs),
            };
            let delivered = if mock {
                send_once(&config, mock_radio(), destination, &text, options).await?
            } else {
                let port = port.unwrap_or_else(|| config.device.port.clone());
                let transport = serial_transport(&port, config.device.baud_rate)?;
                send_once(&config, transport, destination, &text, options).await?
            };
            if !delivered {
                std::process::exit(1);
            }
        }
        Commands::Nodes => {
            let path = &config.storage.node_cache_file;
            if path.is_empty() {
                println!("Node persistence is disabled (storage.node_cache_file is empty).");
                return Ok(());
            }
            let store = JsonNodeStore::new(path);
            let mut registry = NodeRegistry::new();
            registry.load(&store)?;
            if registry.count() == 0 {
                println!("No nodes recorded in {}", path);
                return Ok(());
            }
            println!("{:<11} {:<24} {:<20} {:>6} {:>5}", "ID", "NAME", "LAST SEEN", "SNR", "HOPS");
            for node in registry.list() {
                let snr = node
                    .signal
                    .map(|s| format!("{:.1}", s.snr))
                    .unwrap_or_else(|| "-".into());
                let hops = node
                    .hops_away
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<11} {:<24} {:<20} {:>6} {:>5}",
                    node.id.to_string(),
                    node.label(),
                    node.last_seen.format("%Y-%m-%d %H:%M:%S"),
                    snr,
                    hops
                );
            }
        }
        Commands::Ports => list_serial_ports()?,
        Commands::Init => {
            info!("Initializing new meshsession configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
    }

    Ok(())
}

fn node_store(config: &Config) -> Arc<dyn NodeStore> {
    if config.storage.node_cache_file.is_empty() {
        info!("node persistence disabled; node table kept in memory only");
        Arc::new(MemoryNodeStore::new())
    } else {
        Arc::new(JsonNodeStore::new(&config.storage.node_cache_file))
    }
}

fn mock_radio() -> MockTransport {
    MockTransport::echo_radio(NodeId(0x0bad_cafe), NodeId(0x1234_5678))
}

#[cfg(feature = "serial")]
fn serial_transport(port: &str, baud: u32) -> Result<meshsession::transport::SerialTransport> {
    Ok(meshsession::transport::SerialTransport::new(port, baud))
}

#[cfg(not(feature = "serial"))]
fn serial_transport(_port: &str, _baud: u32) -> Result<MockTransport> {
    Err(anyhow!(
        "serial support not compiled in; rebuild with the 'serial' feature or pass --mock"
    ))
}

#[cfg(feature = "serial")]
fn list_serial_ports() -> Result<()> {
    let ports = meshsession::transport::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for p in ports {
        println!("{:<24} {}", p.name, p.description);
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
fn list_serial_ports() -> Result<()> {
    log::error!("Listing ports requires the 'serial' feature");
    std::process::exit(2);
}

async fn monitor<T: Transport>(config: &Config, transport: T) -> Result<()> {
    let (session, mut events) = Session::spawn(config.into(), transport, node_store(config));
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(ev) => print_event(&ev),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }
    shutdown(&session, &mut events).await;
    let m = session.metrics();
    info!(
        "sent={} retries={} acked={} expired={} rejected={} reconnects={} frames_in={} dropped={}",
        m.sent, m.retries, m.acked, m.expired, m.rejected, m.reconnects, m.frames_in, m.frames_dropped
    );
    Ok(())
}

/// Returns true when the message was confirmed.
async fn send_once<T: Transport>(
    config: &Config,
    transport: T,
    destination: Destination,
    text: &str,
    options: SendOptions,
) -> Result<bool> {
    let (session, mut events) = Session::spawn(config.into(), transport, node_store(config));
    let id = session
        .send_message_with(destination, text, options)
        .await?;
    info!("message {} queued for {}", id, destination);

    let mut delivered = false;
    loop {
        tokio::select! {
            ev = events.recv() => match ev {
                Some(SessionEvent::DeliveryConfirmed { message_id, attempts, latency }) if message_id == id => {
                    println!("delivered after {} attempt(s) in {:.1}s", attempts, latency.as_secs_f32());
                    delivered = true;
                    break;
                }
                Some(SessionEvent::DeliveryFailed { message_id, attempts, reason }) if message_id == id => {
                    println!("not delivered after {} attempt(s): {}", attempts, reason);
                    break;
                }
                Some(SessionEvent::ConnectionStateChanged(state)) => info!("connection {}", state),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                if let Ok(true) = session.cancel_message(id).await {
                    println!("cancelled");
                }
                break;
            }
        }
    }
    shutdown(&session, &mut events).await;
    Ok(delivered)
}

async fn shutdown(session: &SessionHandle, events: &mut SessionEvents) {
    if let Err(e) = session.shutdown().await {
        warn!("session shutdown: {}", e);
    }
    while let Ok(ev) = events.try_recv() {
        print_event(&ev);
    }
}

fn print_event(event: &SessionEvent) {
    let ts = chrono::Local::now().format("%H:%M:%S");
    match event {
        SessionEvent::ConnectionStateChanged(state) => println!("{} * link {}", ts, state),
        SessionEvent::ConnectionRestored => println!("{} * link restored", ts),
        SessionEvent::MessageReceived(msg) => {
            let from = msg.from_name.clone().unwrap_or_else(|| msg.from.to_string());
            let scope = if msg.is_direct() { "dm" } else { "ch" };
            println!("{} <{}> [{}{}] {}", ts, from, scope, msg.channel, msg.text);
        }
        SessionEvent::NodeDiscovered(node) => {
            println!("{} + node {} ({})", ts, node.id, node.label())
        }
        SessionEvent::NodeUpdated(_) => {}
        SessionEvent::DeliveryConfirmed {
            message_id,
            attempts,
            latency,
        } => println!(
            "{} ✓ {} acked (attempts={}, {}ms)",
            ts,
            message_id,
            attempts,
            latency.as_millis()
        ),
        SessionEvent::DeliveryFailed {
            message_id,
            attempts,
            reason,
        } => println!("{} ✗ {} failed (attempts={}): {}", ts, message_id, attempts, reason),
        SessionEvent::DeliveryCancelled { message_id } => {
            println!("{} - {} cancelled", ts, message_id)
        }
        SessionEvent::DeviceTelemetry(t) => println!(
            "{} ~ {} battery={} voltage={}",
            ts,
            t.node,
            t.battery_level
                .map(|b| format!("{}%", b))
                .unwrap_or_else(|| "?".into()),
            t.voltage
                .map(|v| format!("{:.2}V", v))
                .unwrap_or_else(|| "?".into())
        ),
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.clone())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let file = std::sync::Mutex::new(f);
        // mirror to the console only when someone is watching it
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
