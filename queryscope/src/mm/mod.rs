//! Periodic metrics (MM).
//!
//! Monitors collect point-in-time metric samples on a clock tick; an
//! aggregator folds the samples into per-metric statistics and emits a
//! report to the spool at each report boundary. The heavy lifting (aligned
//! ticks, store-and-forward) is shared with the rest of the agent; this
//! module stays deliberately small.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Tick};
use crate::data::SpoolHandle;
use crate::paths::Paths;
use crate::proto::{Cmd, Reply};
use crate::service::{ServiceError, ServiceManager, ServiceState};
use crate::status::StatusRegistry;
use crate::task::GuardedTask;

/// Service tag of the metrics service.
pub const SERVICE_NAME: &str = "mm";

#[derive(Debug, Error)]
pub enum MmError {
    #[error("collect: {0}")]
    Collect(String),
    #[error("metrics I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// One sampled metric.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

/// All metrics one monitor sampled on one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub ts: DateTime<Utc>,
    pub metrics: Vec<Metric>,
}

/// Samples a set of metrics on demand.
pub trait Monitor: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn collect(&self) -> BoxFuture<'_, Result<Collection, MmError>>;
}

/// Per-metric summary over one report period.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Stats {
    pub cnt: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Stats {
    fn observe(&mut self, value: f64) {
        if self.cnt == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.cnt += 1;
        self.sum += value;
        self.avg = self.sum / self.cnt as f64;
    }
}

/// The spooled metrics report.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MmReport {
    pub ts: Option<DateTime<Utc>>,
    /// Report period length in seconds.
    pub duration: u64,
    pub stats: BTreeMap<String, Stats>,
}

/// Folds collections into per-metric stats between report boundaries.
#[derive(Default)]
pub struct Aggregator {
    started: Option<DateTime<Utc>>,
    stats: BTreeMap<String, Stats>,
}

impl Aggregator {
    pub fn add(&mut self, collection: &Collection) {
        self.started.get_or_insert(collection.ts);
        for metric in &collection.metrics {
            self.stats
                .entry(metric.name.clone())
                .or_default()
                .observe(metric.value);
        }
    }

    /// Emits the period's report and resets, or `None` if nothing was
    /// collected this period.
    pub fn report(&mut self, duration: u64) -> Option<MmReport> {
        if self.stats.is_empty() {
            return None;
        }
        let report = MmReport {
            ts: self.started.take(),
            duration,
            stats: std::mem::take(&mut self.stats),
        };
        Some(report)
    }
}

/// Config of the metrics service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MmConfig {
    /// Seconds between samples.
    pub collect_interval: u64,
    /// Seconds between spooled reports.
    pub report_interval: u64,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            collect_interval: 10,
            report_interval: 60,
        }
    }
}

/// Load-average monitor, the one monitor the agent always has.
pub struct LoadAvgMonitor;

impl Monitor for LoadAvgMonitor {
    fn name(&self) -> &str {
        "loadavg"
    }

    fn collect(&self) -> BoxFuture<'_, Result<Collection, MmError>> {
        Box::pin(async {
            let raw = tokio::fs::read_to_string("/proc/loadavg").await?;
            let mut fields = raw.split_whitespace();
            let mut metrics = Vec::with_capacity(3);
            for name in ["loadavg/1m", "loadavg/5m", "loadavg/15m"] {
                let value = fields
                    .next()
                    .and_then(|f| f.parse().ok())
                    .ok_or_else(|| MmError::Collect("malformed /proc/loadavg".into()))?;
                metrics.push(Metric {
                    name: name.to_string(),
                    value,
                });
            }
            Ok(Collection {
                ts: Utc::now(),
                metrics,
            })
        })
    }
}

struct RunningMm {
    loop_task: GuardedTask,
    tick_tx: mpsc::Sender<Tick>,
}

/// Manager of the `mm` service.
pub struct MmManager {
    paths: Paths,
    clock: Arc<Clock>,
    monitors: Vec<Arc<dyn Monitor>>,
    spool: SpoolHandle,
    status: Arc<StatusRegistry>,
    state: Mutex<Option<RunningMm>>,
    running: AtomicBool,
    config: StdMutex<Option<MmConfig>>,
}

impl MmManager {
    pub fn new(
        paths: Paths,
        clock: Arc<Clock>,
        monitors: Vec<Arc<dyn Monitor>>,
        spool: SpoolHandle,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            paths,
            clock,
            monitors,
            spool,
            status,
            state: Mutex::new(None),
            running: AtomicBool::new(false),
            config: StdMutex::new(None),
        }
    }

    fn stored_config(&self) -> Option<MmConfig> {
        self.config.lock().ok().and_then(|c| c.clone())
    }

    fn start_inner(&self, config: Value) -> Result<RunningMm, ServiceError> {
        let config: MmConfig = if config.is_null() {
            MmConfig::default()
        } else {
            serde_json::from_value(config)?
        };

        if let Err(e) = self.paths.write_service_config(SERVICE_NAME, &config) {
            warn!(error = %e, "failed to persist mm config");
        }

        let (tick_tx, tick_rx) = mpsc::channel(4);
        self.clock.add(tick_tx.clone(), config.collect_interval.max(1));

        let mm_loop = MmLoop {
            tick_rx,
            monitors: self.monitors.clone(),
            aggregator: Aggregator::default(),
            spool: self.spool.clone(),
            report_interval: config.report_interval.max(1),
        };
        let loop_task = GuardedTask::spawn("mm", move |token| mm_loop.run(token));

        if let Ok(mut stored) = self.config.lock() {
            *stored = Some(config);
        }
        Ok(RunningMm {
            loop_task,
            tick_tx,
        })
    }
}

impl ServiceManager for MmManager {
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

            match self.start_inner(config) {
                Ok(running) => {
                    *state = Some(running);
                    self.running.store(true, Ordering::SeqCst);
                    self.status.update(SERVICE_NAME, ServiceState::Ready.as_str());
                    info!(monitors = self.monitors.len(), "mm service ready");
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
            running.loop_task.stop_and_wait().await;

            if let Ok(mut stored) = self.config.lock() {
                *stored = None;
            }
            self.running.store(false, Ordering::SeqCst);
            self.status
                .update(SERVICE_NAME, ServiceState::Stopped.as_str());
            info!("mm service stopped");
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

struct MmLoop {
    tick_rx: mpsc::Receiver<Tick>,
    monitors: Vec<Arc<dyn Monitor>>,
    aggregator: Aggregator,
    spool: SpoolHandle,
    report_interval: u64,
}

impl MmLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return,

                tick = self.tick_rx.recv() => match tick {
                    Some(now) => self.on_tick(now).await,
                    None => return,
                },
            }
        }
    }

    async fn on_tick(&mut self, now: Tick) {
        for monitor in &self.monitors {
            match monitor.collect().await {
                Ok(collection) => self.aggregator.add(&collection),
                Err(e) => warn!(monitor = monitor.name(), error = %e, "collect failed"),
            }
        }

        // Ticks are boundary-aligned, so the report period closes exactly
        // when the tick lands on a report boundary.
        if now.timestamp().rem_euclid(self.report_interval as i64) == 0 {
            if let Some(report) = self.aggregator.report(self.report_interval) {
                debug!(metrics = report.stats.len(), "spooling metrics report");
                match serde_json::to_value(&report) {
                    Ok(value) => {
                        if let Err(e) = self.spool.write(SERVICE_NAME, value) {
                            warn!(error = %e, "dropping metrics report, spool write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping metrics report, encode failed"),
                }
            }
        }
    }
}
