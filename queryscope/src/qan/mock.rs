//! Test doubles for the QAN pipeline.
//!
//! The manager is exercised in tests through the same capability traits
//! the production types implement: a worker that blocks until released
//! (to pin pool-exhaustion and deferred-removal behavior) and an interval
//! source fed directly by the test instead of by ticks.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::iter::{IterFactory, IterHandle};
use super::worker::{Worker, WorkerFactory};
use super::{Interval, QanConfig, QanError, QanResult};
use crate::clock::Tick;

/// Control handle for one scripted [`MockWorker`].
pub struct MockWorkerHandle {
    running_rx: mpsc::Receiver<()>,
    release_tx: mpsc::Sender<()>,
}

impl MockWorkerHandle {
    /// Waits until the manager actually ran the worker.
    pub async fn wait_running(&mut self) {
        let _ = self.running_rx.recv().await;
    }

    /// True once the worker's `run` has started.
    pub fn try_running(&mut self) -> bool {
        self.running_rx.try_recv().is_ok()
    }

    /// Lets a blocked worker finish.
    pub async fn release(&self) {
        let _ = self.release_tx.send(()).await;
    }
}

/// Scripted worker: signals when running, then blocks until released or
/// stopped, then returns its canned result.
pub struct MockWorker {
    name: String,
    result: QanResult,
    stop: CancellationToken,
    running_tx: mpsc::Sender<()>,
    release_rx: Option<mpsc::Receiver<()>>,
    block: bool,
}

impl MockWorker {
    /// A worker that blocks until its handle releases it.
    pub fn blocking(result: QanResult) -> (MockWorkerScript, MockWorkerHandle) {
        Self::script(result, true)
    }

    /// A worker that completes immediately.
    pub fn instant(result: QanResult) -> (MockWorkerScript, MockWorkerHandle) {
        Self::script(result, false)
    }

    fn script(result: QanResult, block: bool) -> (MockWorkerScript, MockWorkerHandle) {
        let (running_tx, running_rx) = mpsc::channel(1);
        let (release_tx, release_rx) = mpsc::channel(1);
        (
            MockWorkerScript {
                result,
                running_tx,
                release_rx,
                block,
            },
            MockWorkerHandle {
                running_rx,
                release_tx,
            },
        )
    }
}

/// The factory-side half of a scripted worker.
pub struct MockWorkerScript {
    result: QanResult,
    running_tx: mpsc::Sender<()>,
    release_rx: mpsc::Receiver<()>,
    block: bool,
}

impl Worker for MockWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn setup(&mut self, _interval: &Interval) -> Result<(), QanError> {
        Ok(())
    }

    fn run(&mut self) -> BoxFuture<'_, Result<QanResult, QanError>> {
        let stop = self.stop.clone();
        let running = self.running_tx.clone();
        let release = self.release_rx.take();
        let block = self.block;
        let result = self.result.clone();
        Box::pin(async move {
            let _ = running.try_send(());
            if block {
                if let Some(mut release) = release {
                    tokio::select! {
                        _ = release.recv() => {}
                        _ = stop.cancelled() => {}
                    }
                }
            }
            Ok(result)
        })
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    fn cleanup(&mut self) {}

    fn status(&self) -> String {
        "ok".to_string()
    }
}

/// Hands out scripted workers in order; panics if the manager asks for
/// more workers than the test scripted.
pub struct MockWorkerFactory {
    scripts: Mutex<VecDeque<MockWorkerScript>>,
    made: Mutex<Vec<String>>,
}

impl MockWorkerFactory {
    pub fn new(scripts: Vec<MockWorkerScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            made: Mutex::new(Vec::new()),
        }
    }

    /// Names the manager assigned to the workers it created, in order.
    pub fn made(&self) -> Vec<String> {
        self.made.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl WorkerFactory for MockWorkerFactory {
    fn make(&self, name: &str, _config: &QanConfig) -> Box<dyn Worker> {
        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .expect("test scripted too few workers");
        if let Ok(mut made) = self.made.lock() {
            made.push(name.to_string());
        }
        Box::new(MockWorker {
            name: name.to_string(),
            result: script.result,
            stop: CancellationToken::new(),
            running_tx: script.running_tx,
            release_rx: Some(script.release_rx),
            block: script.block,
        })
    }
}

/// Interval source fed directly by the test; ticks are ignored.
pub struct MockIterFactory {
    intervals: Mutex<Option<mpsc::Receiver<Interval>>>,
}

impl MockIterFactory {
    /// Returns the factory and the sender the test injects intervals with.
    pub fn new() -> (Self, mpsc::Sender<Interval>) {
        let (tx, rx) = mpsc::channel(4);
        (
            Self {
                intervals: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

impl IterFactory for MockIterFactory {
    fn spawn(&self, _tick_rx: mpsc::Receiver<Tick>) -> IterHandle {
        let intervals = self
            .intervals
            .lock()
            .ok()
            .and_then(|mut i| i.take())
            .expect("mock iterator spawned twice");
        IterHandle {
            intervals,
            task: None,
        }
    }
}
