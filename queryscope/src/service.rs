//! Service manager contract.
//!
//! Each telemetry service (query analytics, metrics, data path) is owned by
//! a manager implementing [`ServiceManager`]. The agent drives managers
//! exclusively through this trait, which keeps the real services and the
//! test doubles interchangeable.

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::proto::{Cmd, Reply};

/// Lifecycle states of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "Stopped",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::Stopping => "Stopping",
            Self::Failed => "Failed",
        }
    }
}

/// Errors surfaced to the control plane as reply error strings.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service {0} already running")]
    AlreadyRunning(String),
    #[error("service {0} not running")]
    NotRunning(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("bad command payload: {0}")]
    Decode(String),
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

/// A supervised telemetry service.
///
/// `start` and `stop` may take arbitrarily long; the agent runs them on its
/// command-handler task and keeps answering `Status` meanwhile. Methods
/// return boxed futures so managers stay object-safe behind `Arc<dyn ...>`.
pub trait ServiceManager: Send + Sync + 'static {
    /// The service tag ("qan", "mm", "data").
    fn name(&self) -> &str;

    /// Starts the service with the decoded config payload.
    fn start<'a>(&'a self, cmd: &'a Cmd, config: Value) -> BoxFuture<'a, Result<(), ServiceError>>;

    /// Stops the service and tears down its resources.
    fn stop<'a>(&'a self, cmd: &'a Cmd) -> BoxFuture<'a, Result<(), ServiceError>>;

    /// One-line status for the agent's status report.
    fn status(&self) -> String;

    /// Whether a `start` has succeeded without an intervening `stop`.
    fn is_running(&self) -> bool;

    /// Service-routed verbs other than start/stop (`GetConfig`, ...).
    fn handle<'a>(&'a self, cmd: &'a Cmd) -> BoxFuture<'a, Reply>;
}
