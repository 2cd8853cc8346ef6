//! Guarded background tasks.
//!
//! Every long-lived loop in the agent runs under a [`GuardedTask`]: a
//! spawned future paired with a cancellation token and a join handle. A
//! panic inside the task is caught at join time and logged with the task's
//! name instead of unwinding the process; the supervisor observes the
//! termination through [`wait`](GuardedTask::wait).

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// A supervised background task.
pub struct GuardedTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl GuardedTask {
    /// Spawns `f` with a fresh cancellation token.
    ///
    /// The closure receives the token; the task is expected to select on it
    /// and return promptly once it fires.
    pub fn spawn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let handle = tokio::spawn(f(token.clone()));
        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    /// The task's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signals the task to stop. Returns immediately.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for the task to finish, logging a panic if one occurred.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(task = %self.name, "background task panicked: {}", e);
                }
            }
        }
    }

    /// Convenience: [`stop`](Self::stop) then [`wait`](Self::wait).
    pub async fn stop_and_wait(&mut self) {
        self.stop();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn stop_and_wait_cancels_loop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let mut task = GuardedTask::spawn("loop", move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });

        task.stop_and_wait().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let mut task = GuardedTask::spawn("boom", |_token| async {
            panic!("kaboom");
        });
        // Must not propagate the panic to the caller.
        tokio::time::timeout(Duration::from_secs(1), task.wait())
            .await
            .expect("join completes");
    }

    #[tokio::test]
    async fn wait_twice_is_harmless() {
        let mut task = GuardedTask::spawn("once", |_token| async {});
        task.wait().await;
        task.wait().await;
    }
}
