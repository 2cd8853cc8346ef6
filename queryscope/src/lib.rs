//! Queryscope - database host monitoring agent
//!
//! This library provides the core of a long-lived agent that runs on a
//! database host, keeps a duplex command channel to a remote control plane,
//! and supervises in-process telemetry services: query analytics from the
//! slow log, periodic metrics, and a store-and-forward data path.
//!
//! # High-Level API
//!
//! The [`agent`] module ties everything together:
//!
//! ```ignore
//! use queryscope::agent::Agent;
//! use queryscope::channel::{CommandChannel, SocketTransport};
//!
//! let (channel, handles) = CommandChannel::new(SocketTransport::new(addr));
//! tokio::spawn(channel.run(shutdown.clone()));
//!
//! let agent = Agent::new(status, services, handles);
//! agent.run(shutdown).await;
//! ```

pub mod agent;
pub mod channel;
pub mod clock;
pub mod config;
pub mod data;
pub mod logging;
pub mod mm;
pub mod mysql;
pub mod paths;
pub mod proto;
pub mod qan;
pub mod service;
pub mod status;
pub mod task;

/// Version of the queryscope library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
