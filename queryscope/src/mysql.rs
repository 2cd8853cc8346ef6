//! Database settings facility.
//!
//! The agent only ever runs short `SET GLOBAL ...` style statements against
//! the monitored database (enable the slow log, adjust the threshold,
//! trigger a reopen after rotation). The driver itself lives outside this
//! crate; here is the contract plus a recording implementation used by the
//! test suites.

use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::ServiceInstance;

/// One settings statement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Query {
    pub set: String,
}

impl Query {
    pub fn set(stmt: impl Into<String>) -> Self {
        Self { set: stmt.into() }
    }
}

/// Errors from the settings facility.
#[derive(Debug, Error)]
pub enum MysqlError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("exec: {0}")]
    Exec(String),
}

/// Executes settings statements against one database instance.
pub trait Connector: Send + Sync + 'static {
    /// Runs the statements in order; stops at the first failure.
    fn exec(&self, queries: &[Query]) -> BoxFuture<'_, Result<(), MysqlError>>;
}

/// Produces connectors for monitored instances.
pub trait ConnectorFactory: Send + Sync + 'static {
    fn make(&self, instance: &ServiceInstance)
        -> Result<std::sync::Arc<dyn Connector>, MysqlError>;
}

/// Recording connector: executes nothing, remembers everything.
///
/// Shared by unit and integration tests to assert exactly which settings
/// statements a component issued and in which order.
#[derive(Default)]
pub struct NullConnector {
    executed: Mutex<Vec<Query>>,
}

impl NullConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All statements executed so far, in order.
    pub fn executed(&self) -> Vec<Query> {
        self.executed.lock().map(|q| q.clone()).unwrap_or_default()
    }

    /// Clears the recording.
    pub fn reset(&self) {
        if let Ok(mut q) = self.executed.lock() {
            q.clear();
        }
    }
}

impl Connector for NullConnector {
    fn exec(&self, queries: &[Query]) -> BoxFuture<'_, Result<(), MysqlError>> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.extend_from_slice(queries);
        }
        Box::pin(async { Ok(()) })
    }
}

/// Factory that hands out one shared [`NullConnector`].
pub struct NullConnectorFactory {
    conn: std::sync::Arc<NullConnector>,
}

impl NullConnectorFactory {
    pub fn new(conn: std::sync::Arc<NullConnector>) -> Self {
        Self { conn }
    }
}

impl ConnectorFactory for NullConnectorFactory {
    fn make(
        &self,
        _instance: &ServiceInstance,
    ) -> Result<std::sync::Arc<dyn Connector>, MysqlError> {
        Ok(self.conn.clone())
    }
}
