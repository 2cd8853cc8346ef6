//! Data path: spool, serializer, sender, and the `data` service manager.
//!
//! Telemetry services never talk to the control plane directly. They append
//! payloads to the spool through a [`SpoolHandle`]; the sender drains the
//! spool over the command channel on a clock tick. The pipeline survives
//! transport outages because everything sits on disk until acked.

pub mod sender;
pub mod serializer;
pub mod spool;

pub use sender::Sender;
pub use serializer::{serializer_for, JsonGzipSerializer, JsonSerializer, Serializer};
pub use spool::{DiskSpool, MemorySpool, SpoolError, SpoolId, Spooler};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::channel::DataSender;
use crate::clock::{Clock, Tick};
use crate::paths::Paths;
use crate::proto::{Cmd, Reply};
use crate::service::{ServiceError, ServiceManager, ServiceState};
use crate::status::StatusRegistry;
use crate::task::GuardedTask;

/// Service tag of the data path.
pub const SERVICE_NAME: &str = "data";

/// Default seconds between sender drain passes.
pub const DEFAULT_SEND_INTERVAL: u64 = 63;

/// The spooled unit. Opaque to the sender once encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub ts: DateTime<Utc>,
    pub service: String,
    pub data: Value,
}

/// Config of the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DataConfig {
    /// "" for plain JSON, "gzip" for compressed.
    pub encoding: String,
    /// Seconds between drain passes.
    pub send_interval: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            encoding: String::new(),
            send_interval: DEFAULT_SEND_INTERVAL,
        }
    }
}

/// Producers' entry point to the spool.
///
/// The handle is installed when the data service starts and cleared when it
/// stops; writes in between fail with [`SpoolError::NotRunning`], which
/// producers treat as drop-with-warn.
#[derive(Clone, Default)]
pub struct SpoolHandle {
    inner: Arc<RwLock<Option<Arc<dyn Spooler>>>>,
}

impl SpoolHandle {
    /// A handle with no spool installed yet.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A handle permanently bound to `spool` (used by tests).
    pub fn fixed(spool: Arc<dyn Spooler>) -> Self {
        let handle = Self::default();
        handle.install(spool);
        handle
    }

    /// Appends one payload for `service`.
    pub fn write(&self, service: &str, data: Value) -> Result<SpoolId, SpoolError> {
        let guard = self.inner.read().map_err(|_| SpoolError::NotRunning)?;
        match guard.as_ref() {
            Some(spool) => spool.write(service, data),
            None => Err(SpoolError::NotRunning),
        }
    }

    fn install(&self, spool: Arc<dyn Spooler>) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(spool);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = None;
        }
    }
}

struct RunningData {
    sender_task: GuardedTask,
    tick_tx: mpsc::Sender<Tick>,
}

/// Manager of the `data` service.
pub struct DataManager {
    paths: Paths,
    clock: Arc<Clock>,
    data_sender: DataSender,
    status: Arc<StatusRegistry>,
    handle: SpoolHandle,
    state: Mutex<Option<RunningData>>,
    running: AtomicBool,
    config: StdMutex<Option<DataConfig>>,
}

impl DataManager {
    pub fn new(
        paths: Paths,
        clock: Arc<Clock>,
        data_sender: DataSender,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            paths,
            clock,
            data_sender,
            status,
            handle: SpoolHandle::empty(),
            state: Mutex::new(None),
            running: AtomicBool::new(false),
            config: StdMutex::new(None),
        }
    }

    /// The producer-side handle other services write through.
    pub fn spool_handle(&self) -> SpoolHandle {
        self.handle.clone()
    }

    fn decode_config(config: Value) -> Result<DataConfig, ServiceError> {
        if config.is_null() {
            return Ok(DataConfig::default());
        }
        Ok(serde_json::from_value(config)?)
    }

    async fn start_inner(&self, config: Value) -> Result<RunningData, ServiceError> {
        let config = Self::decode_config(config)?;
        let serializer = serializer_for(&config.encoding)
            .ok_or_else(|| ServiceError::UnknownEncoding(config.encoding.clone()))?;

        let spool = DiskSpool::new(self.paths.data_dir(), serializer)
            .map_err(|e| ServiceError::Other(e.to_string()))?;
        let spool: Arc<dyn Spooler> = Arc::new(spool);
        self.handle.install(Arc::clone(&spool));

        let (tick_tx, tick_rx) = mpsc::channel(4);
        self.clock.add(tick_tx.clone(), config.send_interval.max(1));

        let sender = Sender::new(
            spool,
            self.data_sender.clone(),
            tick_rx,
            Arc::clone(&self.status),
        );
        let sender_task = GuardedTask::spawn("data-sender", move |token| sender.run(token));

        if let Err(e) = self.paths.write_service_config(SERVICE_NAME, &config) {
            warn!(error = %e, "failed to persist data config");
        }
        if let Ok(mut stored) = self.config.lock() {
            *stored = Some(config);
        }

        Ok(RunningData {
            sender_task,
            tick_tx,
        })
    }

    fn stored_config(&self) -> Option<DataConfig> {
        self.config.lock().ok().and_then(|c| c.clone())
    }
}

impl ServiceManager for DataManager {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    fn start<'a>(&'a self, _cmd: &'a Cmd, config: Value) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.is_some() {
                return Err(ServiceError::AlreadyRunning(SERVICE_NAME.into()));
            }
            self.status
                .update(SERVICE_NAME, ServiceState::Starting.as_str());

            match self.start_inner(config).await {
                Ok(running) => {
                    *state = Some(running);
                    self.running.store(true, Ordering::SeqCst);
                    self.status.update(SERVICE_NAME, ServiceState::Ready.as_str());
                    info!("data service ready");
                    Ok(())
                }
                Err(e) => {
                    self.status.update(SERVICE_NAME, ServiceState::Failed.as_str());
                    Err(e)
                }
            }
        })
    }

    fn stop<'a>(&'a self, _cmd: &'a Cmd) -> BoxFuture<'a, Result<(), ServiceError>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(mut running) = state.take() else {
                // A failed service is stoppable back into Stopped.
                if self.status.get(SERVICE_NAME) == ServiceState::Failed.as_str() {
                    self.status
                        .update(SERVICE_NAME, ServiceState::Stopped.as_str());
                }
                return Ok(());
            };
            self.status
                .update(SERVICE_NAME, ServiceState::Stopping.as_str());

            self.clock.remove(&running.tick_tx);
            running.sender_task.stop_and_wait().await;
            self.handle.clear();

            if let Ok(mut stored) = self.config.lock() {
                *stored = None;
            }
            self.running.store(false, Ordering::SeqCst);
            self.status
                .update(SERVICE_NAME, ServiceState::Stopped.as_str());
            info!("data service stopped");
            Ok(())
        })
    }

    fn status(&self) -> String {
        self.status.get(SERVICE_NAME)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn handle<'a>(&'a self, cmd: &'a Cmd) -> BoxFuture<'a, Reply> {
        Box::pin(async move {
            match cmd.cmd.as_str() {
                "GetConfig" => match self.stored_config() {
                    Some(config) => match serde_json::to_value(&config) {
                        Ok(value) => cmd.reply_ok(value),
                        Err(e) => cmd.reply_err(e),
                    },
                    None => cmd.reply_err(ServiceError::NotRunning(SERVICE_NAME.into())),
                },
                other => cmd.reply_err(ServiceError::UnknownCommand(other.to_string())),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{mock_channel_pair, CommandChannel};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        _tmp: TempDir,
        _remote: crate::channel::MockRemote,
        manager: DataManager,
        shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::new(tmp.path()).unwrap();
        let clock = Arc::new(Clock::new());
        let status = Arc::new(StatusRegistry::new(&[SERVICE_NAME, sender::STATUS_KEY]));

        let (transport, remote) = mock_channel_pair();
        let (channel, handles) = CommandChannel::new(transport);
        let shutdown = CancellationToken::new();
        tokio::spawn(channel.run(shutdown.clone()));

        let manager = DataManager::new(paths, clock, handles.data.clone(), status);
        Fixture {
            _tmp: tmp,
            _remote: remote,
            manager,
            shutdown,
        }
    }

    #[tokio::test]
    async fn start_installs_spool_and_persists_config() {
        let f = fixture();
        let cmd = Cmd::default();

        f.manager
            .start(&cmd, serde_json::json!({"SendInterval": 61}))
            .await
            .unwrap();
        assert!(f.manager.is_running());
        assert_eq!(f.manager.status(), "Ready");

        let handle = f.manager.spool_handle();
        handle.write("qan", serde_json::json!({"x": 1})).unwrap();

        let persisted: DataConfig = f
            .manager
            .paths
            .read_service_config(SERVICE_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(persisted.send_interval, 61);

        f.manager.stop(&cmd).await.unwrap();
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn double_start_is_already_running() {
        let f = fixture();
        let cmd = Cmd::default();
        f.manager.start(&cmd, Value::Null).await.unwrap();

        let err = f.manager.start(&cmd, Value::Null).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyRunning(_)));

        f.manager.stop(&cmd).await.unwrap();
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn unknown_encoding_is_rejected() {
        let f = fixture();
        let cmd = Cmd::default();
        let err = f
            .manager
            .start(&cmd, serde_json::json!({"Encoding": "zstd"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownEncoding(_)));
        assert!(!f.manager.is_running());
        assert_eq!(f.manager.status(), "Failed");

        // A failed service can still be stopped cleanly.
        f.manager.stop(&cmd).await.unwrap();
        assert_eq!(f.manager.status(), "Stopped");
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn stop_tears_down_and_writes_fail() {
        let f = fixture();
        let cmd = Cmd::default();
        f.manager.start(&cmd, Value::Null).await.unwrap();
        let handle = f.manager.spool_handle();

        f.manager.stop(&cmd).await.unwrap();
        assert!(!f.manager.is_running());
        assert_eq!(f.manager.status(), "Stopped");

        let err = handle.write("qan", Value::Null).unwrap_err();
        assert!(matches!(err, SpoolError::NotRunning));

        // Stopping again is harmless.
        f.manager.stop(&cmd).await.unwrap();
        f.shutdown.cancel();
    }

    #[tokio::test]
    async fn get_config_round_trips() {
        let f = fixture();
        let cmd = Cmd::default();
        f.manager
            .start(&cmd, serde_json::json!({"Encoding": "gzip"}))
            .await
            .unwrap();

        let get = Cmd {
            cmd: "GetConfig".into(),
            service: SERVICE_NAME.into(),
            ..Cmd::default()
        };
        let reply = f.manager.handle(&get).await;
        assert_eq!(reply.error, "");
        let config: DataConfig = serde_json::from_value(reply.data).unwrap();
        assert_eq!(config.encoding, "gzip");

        f.manager.stop(&cmd).await.unwrap();
        f.shutdown.cancel();
    }
}
