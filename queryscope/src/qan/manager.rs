//! QAN service manager.
//!
//! Owns the interval iterator, a bounded pool of workers, and the
//! database-settings connection. The dispatch loop admits intervals into
//! the pool, rotates the slow log when it outgrows its cap, and defers
//! removal of rotated files until the last worker reading them finishes.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::iter::IterFactory;
use super::worker::WorkerFactory;
use super::{make_report, Interval, QanConfig, QanError, QanResult, SERVICE_NAME};
use crate::clock::{Clock, Tick};
use crate::data::SpoolHandle;
use crate::mysql::{Connector, ConnectorFactory};
use crate::paths::Paths;
use crate::proto::{Cmd, Reply};
use crate::service::{ServiceError, ServiceManager, ServiceState};
use crate::status::StatusRegistry;
use crate::task::GuardedTask;

/// Status key of the dispatch loop.
pub const STATUS_PARSER: &str = "qan-log-parser";
/// Status key showing seconds until the next interval.
pub const STATUS_NEXT_INTERVAL: &str = "qan-next-interval";

/// Bounded wait for in-flight workers during service stop.
const STOP_WAIT: Duration = Duration::from_secs(5);

struct RunningQan {
    loop_task: GuardedTask,
    tick_tx: mpsc::Sender<Tick>,
    conn: Arc<dyn Connector>,
    config: QanConfig,
}

/// Manager of the `qan` service.
pub struct QanManager {
    paths: Paths,
    clock: Arc<Clock>,
    conn_factory: Arc<dyn ConnectorFactory>,
    iter_factory: Arc<dyn IterFactory>,
    worker_factory: Arc<dyn WorkerFactory>,
    spool: SpoolHandle,
    status: Arc<StatusRegistry>,
    state: Mutex<Option<RunningQan>>,
    running: AtomicBool,
    config: StdMutex<Option<QanConfig>>,
}

impl QanManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        paths: Paths,
        clock: Arc<Clock>,
        conn_factory: Arc<dyn ConnectorFactory>,
        iter_factory: Arc<dyn IterFactory>,
        worker_factory: Arc<dyn WorkerFactory>,
        spool: SpoolHandle,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            paths,
            clock,
            conn_factory,
            iter_factory,
            worker_factory,
            spool,
            status,
            state: Mutex::new(None),
            running: AtomicBool::new(false),
            config: StdMutex::new(None),
        }
    }

    fn stored_config(&self) -> Option<QanConfig> {
        self.config.lock().ok().and_then(|c| c.clone())
    }

    async fn start_inner(&self, config: Value) -> Result<RunningQan, ServiceError> {
        let config: QanConfig = serde_json::from_value(config)?;

        if let Err(e) = self.paths.write_service_config(SERVICE_NAME, &config) {
            warn!(error = %e, "failed to persist qan config");
        }

        let conn = self
            .conn_factory
            .make(&config.service_instance)
            .map_err(|e| ServiceError::Other(e.to_string()))?;
        conn.exec(&config.start)
            .await
            .map_err(|e| ServiceError::Other(e.to_string()))?;

        let interval_secs = config.interval.max(1);
        let (tick_tx, tick_rx) = mpsc::channel(1);
        self.clock.add(tick_tx.clone(), interval_secs);
        self.status.update(
            STATUS_NEXT_INTERVAL,
            format!("{:.1}s", self.clock.eta(interval_secs)),
        );

        let iter_handle = self.iter_factory.spawn(tick_rx);
        let qan_loop = QanLoop::new(
            iter_handle.intervals,
            iter_handle.task,
            Arc::clone(&self.worker_factory),
            Arc::clone(&conn),
            self.spool.clone(),
            Arc::clone(&self.status),
            Arc::clone(&self.clock),
            config.clone(),
        );
        let loop_task = GuardedTask::spawn("qan", move |token| qan_loop.run(token));

        if let Ok(mut stored) = self.config.lock() {
            *stored = Some(config.clone());
        }
        Ok(RunningQan {
            loop_task,
            tick_tx,
            conn,
            config,
        })
    }
}

impl ServiceManager for QanManager {
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
            self.status.update(STATUS_PARSER, "Starting");

            match self.start_inner(config).await {
                Ok(running) => {
                    *state = Some(running);
                    self.running.store(true, Ordering::SeqCst);
                    self.status.update(SERVICE_NAME, ServiceState::Ready.as_str());
                    info!("qan service ready");
                    Ok(())
                }
                Err(e) => {
                    self.status.update(STATUS_PARSER, "");
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
            running.loop_task.stop_and_wait().await;

            if let Err(e) = running.conn.exec(&running.config.stop).await {
                warn!(error = %e, "failed to run stop queries");
            }

            if let Ok(mut stored) = self.config.lock() {
                *stored = None;
            }
            self.running.store(false, Ordering::SeqCst);
            self.status.update(STATUS_PARSER, "");
            self.status.update(STATUS_NEXT_INTERVAL, "");
            self.status
                .update(SERVICE_NAME, ServiceState::Stopped.as_str());
            info!("qan service stopped");
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

struct WorkerInfo {
    name: String,
    stop: CancellationToken,
}

struct PendingLog {
    path: PathBuf,
    holders: HashSet<u64>,
}

struct WorkerDone {
    id: u64,
    name: String,
    interval: Interval,
    result: Result<QanResult, QanError>,
}

/// The dispatch loop: one per started service.
struct QanLoop {
    intervals: mpsc::Receiver<Interval>,
    iter_task: Option<GuardedTask>,
    worker_factory: Arc<dyn WorkerFactory>,
    conn: Arc<dyn Connector>,
    spool: SpoolHandle,
    status: Arc<StatusRegistry>,
    clock: Arc<Clock>,
    config: QanConfig,
    workers: HashMap<u64, WorkerInfo>,
    next_worker: u64,
    pending_removal: Vec<PendingLog>,
    done_tx: mpsc::Sender<WorkerDone>,
    done_rx: mpsc::Receiver<WorkerDone>,
}

impl QanLoop {
    #[allow(clippy::too_many_arguments)]
    fn new(
        intervals: mpsc::Receiver<Interval>,
        iter_task: Option<GuardedTask>,
        worker_factory: Arc<dyn WorkerFactory>,
        conn: Arc<dyn Connector>,
        spool: SpoolHandle,
        status: Arc<StatusRegistry>,
        clock: Arc<Clock>,
        config: QanConfig,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::channel(16);
        Self {
            intervals,
            iter_task,
            worker_factory,
            conn,
            spool,
            status,
            clock,
            config,
            workers: HashMap::new(),
            next_worker: 0,
            pending_removal: Vec::new(),
            done_tx,
            done_rx,
        }
    }

    async fn run(mut self, shutdown: CancellationToken) {
        self.update_parser_status();
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                done = self.done_rx.recv() => {
                    if let Some(done) = done {
                        self.finish_worker(done);
                    }
                }

                interval = self.intervals.recv() => match interval {
                    Some(interval) => self.dispatch(interval).await,
                    None => break,
                },
            }
        }
        self.shutdown_workers().await;
        if let Some(mut iter_task) = self.iter_task.take() {
            iter_task.stop_and_wait().await;
        }
    }

    async fn dispatch(&mut self, mut interval: Interval) {
        self.status.update(
            STATUS_NEXT_INTERVAL,
            format!("{:.1}s", self.clock.eta(self.config.interval.max(1))),
        );

        if self.workers.len() >= self.config.max_workers.max(1) {
            warn!(
                number = interval.number,
                running = self.workers.len(),
                "All workers busy, dropping interval"
            );
            return;
        }

        if interval.end_offset >= self.config.max_slow_log_size {
            self.rotate(&mut interval).await;
        }

        self.next_worker += 1;
        let id = self.next_worker;
        let name = format!("qan-worker-{}", id);

        let mut worker = self.worker_factory.make(&name, &self.config);
        if let Err(e) = worker.setup(&interval) {
            warn!(worker = %name, error = %e, "worker setup failed");
            return;
        }
        let stop = worker.stop_token();

        // The new worker may read any file still awaiting removal.
        for pending in &mut self.pending_removal {
            pending.holders.insert(id);
        }

        self.workers.insert(
            id,
            WorkerInfo {
                name: name.clone(),
                stop,
            },
        );
        self.update_parser_status();

        let done_tx = self.done_tx.clone();
        debug!(worker = %name, number = interval.number, "launching worker");
        tokio::spawn(async move {
            let mut worker = worker;
            let result = worker.run().await;
            worker.cleanup();
            let _ = done_tx
                .send(WorkerDone {
                    id,
                    name,
                    interval,
                    result,
                })
                .await;
        });
    }

    /// Rotates the slow log under the live writer: signal the database to
    /// reopen, extend the window to the file's true end, move the file
    /// aside, and queue it for removal once its readers drain.
    async fn rotate(&mut self, interval: &mut Interval) {
        info!(
            file = %interval.filename.display(),
            size = interval.end_offset,
            max = self.config.max_slow_log_size,
            "rotating slow log"
        );

        if let Err(e) = self.conn.exec(&self.config.stop).await {
            warn!(error = %e, "rotation stop queries failed");
        }
        if let Err(e) = self.conn.exec(&self.config.start).await {
            warn!(error = %e, "rotation start queries failed");
        }

        // Parse to EOF of the pre-rotation file, not just to the tick.
        match tokio::fs::metadata(&interval.filename).await {
            Ok(meta) => interval.end_offset = meta.len(),
            Err(e) => warn!(error = %e, "cannot stat slow log before rotation"),
        }

        let rotated = PathBuf::from(format!(
            "{}-{}",
            interval.filename.display(),
            Utc::now().timestamp()
        ));
        if let Err(e) = tokio::fs::rename(&interval.filename, &rotated).await {
            warn!(error = %e, "slow log rename failed, skipping rotation");
            return;
        }

        let holders: HashSet<u64> = self.workers.keys().copied().collect();
        self.pending_removal.push(PendingLog {
            path: rotated.clone(),
            holders,
        });

        // The worker for this interval opens the renamed file.
        interval.filename = rotated;
    }

    fn finish_worker(&mut self, done: WorkerDone) {
        self.workers.remove(&done.id);
        self.status.remove(&done.name);

        match done.result {
            Ok(result) => {
                if !result.error.is_empty() {
                    warn!(worker = %done.name, error = %result.error, "worker finished with error");
                }
                let report = make_report(
                    self.config.service_instance.clone(),
                    &done.interval,
                    result,
                    &self.config,
                );
                match serde_json::to_value(&report) {
                    Ok(value) => {
                        if let Err(e) = self.spool.write(SERVICE_NAME, value) {
                            warn!(error = %e, "dropping report, spool write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping report, encode failed"),
                }
            }
            Err(e) => warn!(worker = %done.name, error = %e, "worker failed"),
        }

        for path in release_hold(&mut self.pending_removal, done.id) {
            if self.config.remove_old_slow_logs {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(file = %path.display(), "removed rotated slow log"),
                    Err(e) => warn!(file = %path.display(), error = %e, "cannot remove rotated slow log"),
                }
            }
        }

        self.update_parser_status();
    }

    async fn shutdown_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for info in self.workers.values() {
            debug!(worker = %info.name, "cancelling worker");
            info.stop.cancel();
        }
        let deadline = Instant::now() + STOP_WAIT;
        while !self.workers.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(abandoned = self.workers.len(), "abandoning in-flight workers");
                break;
            }
            match tokio::time::timeout(remaining, self.done_rx.recv()).await {
                Ok(Some(done)) => self.finish_worker(done),
                Ok(None) => break,
                Err(_) => {
                    warn!(abandoned = self.workers.len(), "abandoning in-flight workers");
                    break;
                }
            }
        }
    }

    fn update_parser_status(&self) {
        self.status.update(
            STATUS_PARSER,
            format!(
                "Idle ({} of {} running)",
                self.workers.len(),
                self.config.max_workers
            ),
        );
    }
}

/// Drops `id`'s hold on every pending entry; returns the paths whose
/// holder sets drained and which therefore leave the list now.
fn release_hold(pending: &mut Vec<PendingLog>, id: u64) -> Vec<PathBuf> {
    let mut drained = Vec::new();
    pending.retain_mut(|entry| {
        entry.holders.remove(&id);
        if entry.holders.is_empty() {
            drained.push(entry.path.clone());
            false
        } else {
            true
        }
    });
    drained
}
