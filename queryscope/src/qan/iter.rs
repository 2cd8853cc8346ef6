//! Tick-driven interval iterator.
//!
//! On each clock tick the iterator stats the slow log and turns the bytes
//! written since the previous tick into one [`Interval`]. Rotation is
//! detected by filename change, inode change, or the file shrinking; after
//! a rotation the next window restarts at offset zero.
//!
//! The emit into the manager has a bounded timeout so a stalled consumer
//! loses an interval (with a warning) instead of wedging the iterator.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Interval;
use crate::clock::Tick;
use crate::task::GuardedTask;

/// Default bound on how long an emit may wait for the manager.
pub const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolves the current slow-log path on every tick, so a `SET GLOBAL
/// slow_query_log_file=...` is picked up without restarting the service.
pub trait FilenameResolver: Send + Sync + 'static {
    fn resolve(&self) -> io::Result<PathBuf>;
}

/// Resolver for a path that never moves.
pub struct FixedPath(pub PathBuf);

impl FilenameResolver for FixedPath {
    fn resolve(&self) -> io::Result<PathBuf> {
        Ok(self.0.clone())
    }
}

/// A spawned iterator: its interval stream plus the task driving it.
pub struct IterHandle {
    pub intervals: mpsc::Receiver<Interval>,
    pub task: Option<GuardedTask>,
}

/// Spawns interval iterators; mocked in tests to inject intervals directly.
pub trait IterFactory: Send + Sync + 'static {
    fn spawn(&self, tick_rx: mpsc::Receiver<Tick>) -> IterHandle;
}

/// Production factory for [`FileIntervalIter`].
pub struct FileIterFactory {
    resolver: Arc<dyn FilenameResolver>,
    emit_timeout: Duration,
}

impl FileIterFactory {
    pub fn new(resolver: Arc<dyn FilenameResolver>) -> Self {
        Self {
            resolver,
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
        }
    }

    pub fn with_emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }
}

impl IterFactory for FileIterFactory {
    fn spawn(&self, tick_rx: mpsc::Receiver<Tick>) -> IterHandle {
        let (iter, intervals) =
            FileIntervalIter::new(Arc::clone(&self.resolver), tick_rx, self.emit_timeout);
        let task = GuardedTask::spawn("qan-interval-iter", move |token| iter.run(token));
        IterHandle {
            intervals,
            task: Some(task),
        }
    }
}

struct PrevState {
    start_time: Tick,
    filename: PathBuf,
    inode: u64,
    size: u64,
}

/// The file-backed interval producer.
pub struct FileIntervalIter {
    resolver: Arc<dyn FilenameResolver>,
    tick_rx: mpsc::Receiver<Tick>,
    interval_tx: mpsc::Sender<Interval>,
    emit_timeout: Duration,
    number: u64,
    prev: Option<PrevState>,
}

impl FileIntervalIter {
    pub fn new(
        resolver: Arc<dyn FilenameResolver>,
        tick_rx: mpsc::Receiver<Tick>,
        emit_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Interval>) {
        let (interval_tx, interval_rx) = mpsc::channel(1);
        (
            Self {
                resolver,
                tick_rx,
                interval_tx,
                emit_timeout,
                number: 0,
                prev: None,
            },
            interval_rx,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("interval iterator stopping");
                    return;
                }

                tick = self.tick_rx.recv() => match tick {
                    Some(now) => self.handle_tick(now).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_tick(&mut self, now: Tick) {
        let filename = match self.resolver.resolve() {
            Ok(filename) => filename,
            Err(e) => {
                warn!(error = %e, "cannot resolve slow log path");
                return;
            }
        };
        let meta = match tokio::fs::metadata(&filename).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(file = %filename.display(), error = %e, "cannot stat slow log");
                return;
            }
        };
        let ino = inode(&meta);
        let size = meta.len();

        let Some(prev) = &mut self.prev else {
            // First tick only opens the window.
            self.prev = Some(PrevState {
                start_time: now,
                filename,
                inode: ino,
                size,
            });
            return;
        };

        let rotated = filename != prev.filename || ino != prev.inode || size < prev.size;
        let start_offset = if rotated { 0 } else { prev.size };

        self.number += 1;
        let interval = Interval {
            number: self.number,
            filename: filename.clone(),
            start_time: prev.start_time,
            stop_time: now,
            start_offset,
            end_offset: size,
        };

        prev.start_time = now;
        prev.filename = filename;
        prev.inode = ino;
        prev.size = size;

        match self
            .interval_tx
            .send_timeout(interval, self.emit_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(lost)) => {
                warn!(number = lost.number, "consumer not ready, lost interval");
            }
            Err(SendTimeoutError::Closed(_)) => {}
        }
    }
}

/// Time-window interval producer for offset-less collection backends
/// (performance-schema digests are keyed by time, not by file bytes).
///
/// Emits `[start_time, stop_time)` windows with zero offsets; a matching
/// worker queries its backend for the window instead of reading a file.
pub struct TimeIntervalIter {
    tick_rx: mpsc::Receiver<Tick>,
    interval_tx: mpsc::Sender<Interval>,
    emit_timeout: Duration,
    number: u64,
    start_time: Option<Tick>,
}

impl TimeIntervalIter {
    pub fn new(
        tick_rx: mpsc::Receiver<Tick>,
        emit_timeout: Duration,
    ) -> (Self, mpsc::Receiver<Interval>) {
        let (interval_tx, interval_rx) = mpsc::channel(1);
        (
            Self {
                tick_rx,
                interval_tx,
                emit_timeout,
                number: 0,
                start_time: None,
            },
            interval_rx,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return,

                tick = self.tick_rx.recv() => match tick {
                    Some(now) => self.handle_tick(now).await,
                    None => return,
                },
            }
        }
    }

    async fn handle_tick(&mut self, now: Tick) {
        let Some(start_time) = self.start_time else {
            self.start_time = Some(now);
            return;
        };

        self.number += 1;
        let interval = Interval {
            number: self.number,
            filename: PathBuf::new(),
            start_time,
            stop_time: now,
            start_offset: 0,
            end_offset: 0,
        };
        self.start_time = Some(now);

        match self
            .interval_tx
            .send_timeout(interval, self.emit_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(lost)) => {
                warn!(number = lost.number, "consumer not ready, lost interval");
            }
            Err(SendTimeoutError::Closed(_)) => {}
        }
    }
}

/// Factory for [`TimeIntervalIter`].
pub struct TimeIterFactory {
    emit_timeout: Duration,
}

impl TimeIterFactory {
    pub fn new() -> Self {
        Self {
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
        }
    }
}

impl Default for TimeIterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl IterFactory for TimeIterFactory {
    fn spawn(&self, tick_rx: mpsc::Receiver<Tick>) -> IterHandle {
        let (iter, intervals) = TimeIntervalIter::new(tick_rx, self.emit_timeout);
        let task = GuardedTask::spawn("qan-interval-iter", move |token| iter.run(token));
        IterHandle {
            intervals,
            task: Some(task),
        }
    }
}

#[cfg(unix)]
fn inode(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode(_meta: &std::fs::Metadata) -> u64 {
    0
}
