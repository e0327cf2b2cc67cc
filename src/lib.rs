//! # Meshsession - Session Layer for Meshtastic Radios
//!
//! Meshsession keeps a host application talking to a Meshtastic radio over a link that is
//! expected to fail: USB cables get unplugged, radios reboot, packets on the mesh get lost.
//! It gives the application one stable handle and one ordered event stream on top of that.
//!
//! ## Features
//!
//! - **Self-healing link**: a supervisor task reopens the device with capped exponential
//!   backoff, detects dead or silent links and re-requests radio state after every reconnect.
//! - **Acknowledged delivery**: every outbound text gets a correlation id, is retransmitted
//!   on a fixed interval and ends as exactly one of confirmed, failed or cancelled. Shutting
//!   the session down cancels whatever is still in flight.
//! - **Node registry**: every node heard on the mesh, with names, signal and last-seen time,
//!   persisted to a JSON table so restarts keep their knowledge.
//! - **Pluggable transports**: serial/USB radios (feature `serial`) and an in-process mock
//!   for tests and dry runs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshsession::config::Config;
//! use meshsession::registry::JsonNodeStore;
//! use meshsession::session::{Session, SessionEvent};
//! use meshsession::transport::SerialTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshsession.toml").await?;
//!     let transport = SerialTransport::new(&config.device.port, config.device.baud_rate);
//!     let store = Arc::new(JsonNodeStore::new(&config.storage.node_cache_file));
//!     let (session, mut events) = Session::spawn((&config).into(), transport, store);
//!
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::MessageReceived(msg) = event {
//!             println!("{}: {}", msg.from, msg.text);
//!         }
//!     }
//!     session.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`session`] - the public handle, event stream and the actor that ties everything together
//! - [`supervisor`] - connection state machine, reconnect backoff, liveness checks
//! - [`delivery`] - acknowledgment tracking and retransmission
//! - [`registry`] - node table and its durable store
//! - [`transport`] - device adapters (serial, mock)
//! - [`meshtastic`] - radio wire codec and stream framing
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Session      │ ← handle, events, registry, ack tracker
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Supervisor    │ ← link ownership, reconnects
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   Transport     │ ← serial port / mock
//! └─────────────────┘
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod supervisor;
pub mod transport;
