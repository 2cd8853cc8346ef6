//! Spool drain loop.
//!
//! On every clock tick the sender walks the spool in write order, pushes
//! each entry over the command channel as a bulk-data frame, and deletes
//! entries the transport acked. Any failure stops the pass so that spool
//! egress stays FIFO; the next tick resumes from the same head entry.
//!
//! The sender is the spool's only consumer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::spool::Spooler;
use crate::channel::{DataFrame, DataSender};
use crate::clock::Tick;
use crate::status::StatusRegistry;

/// Status registry key owned by this component.
pub const STATUS_KEY: &str = "data-sender";

pub struct Sender {
    spool: Arc<dyn Spooler>,
    data: DataSender,
    tick_rx: mpsc::Receiver<Tick>,
    status: Arc<StatusRegistry>,
}

impl Sender {
    pub fn new(
        spool: Arc<dyn Spooler>,
        data: DataSender,
        tick_rx: mpsc::Receiver<Tick>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            spool,
            data,
            tick_rx,
            status,
        }
    }

    /// Runs until shutdown; one drain pass per tick.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.status.update(STATUS_KEY, "Idle");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("sender stopping");
                    self.status.update(STATUS_KEY, "Stopped");
                    return;
                }

                tick = self.tick_rx.recv() => {
                    if tick.is_none() {
                        self.status.update(STATUS_KEY, "Stopped");
                        return;
                    }
                    self.drain().await;
                }
            }
        }
    }

    async fn drain(&mut self) {
        let ids = self.spool.files();
        if ids.is_empty() {
            self.status.update(STATUS_KEY, "Idle");
            return;
        }
        debug!(pending = ids.len(), "draining spool");

        let mut sent = 0usize;
        for id in ids {
            self.status.update(STATUS_KEY, format!("Sending {}", id));

            let bytes = match self.spool.read(&id) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(id = %id, error = %e, "spool read failed, pausing drain");
                    self.status.update(STATUS_KEY, format!("Error: {}", e));
                    return;
                }
            };

            let frame = DataFrame {
                content_type: self.spool.content_type().to_string(),
                body: bytes,
            };
            if let Err(e) = self.data.send(frame).await {
                warn!(id = %id, error = %e, "bulk send failed, pausing drain");
                self.status.update(STATUS_KEY, format!("Error: {}", e));
                return;
            }

            if let Err(e) = self.spool.remove(&id) {
                warn!(id = %id, error = %e, "failed to remove sent entry");
            }
            sent += 1;
        }

        debug!(sent, "drain pass complete");
        self.status.update(STATUS_KEY, "Idle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{mock_channel_pair, CommandChannel, Frame};
    use crate::data::spool::MemorySpool;
    use std::time::Duration;

    async fn recv_data(remote: &mut crate::channel::MockRemote) -> DataFrame {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), remote.recv_frame())
                .await
                .expect("frame within 1s")
                .expect("remote open")
            {
                Frame::Data(frame) => return frame,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn drains_in_order_and_removes_on_ack() {
        let (transport, mut remote) = mock_channel_pair();
        let (channel, handles) = CommandChannel::new(transport);
        let shutdown = CancellationToken::new();
        let channel_task = tokio::spawn(channel.run(shutdown.clone()));

        let spool = Arc::new(MemorySpool::new());
        spool.write("qan", serde_json::json!({"n": 1})).unwrap();
        spool.write("qan", serde_json::json!({"n": 2})).unwrap();

        let status = Arc::new(StatusRegistry::new(&[STATUS_KEY]));
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let sender = Sender::new(spool.clone(), handles.data.clone(), tick_rx, status.clone());
        let sender_task = tokio::spawn(sender.run(shutdown.clone()));

        tick_tx.send(chrono::Utc::now()).await.unwrap();

        let first = recv_data(&mut remote).await;
        let second = recv_data(&mut remote).await;
        let n = |frame: &DataFrame| {
            let envelope: crate::data::Envelope = serde_json::from_slice(&frame.body).unwrap();
            envelope.data["n"].as_i64().unwrap()
        };
        assert_eq!(n(&first), 1);
        assert_eq!(n(&second), 2);

        // Acked entries are gone from the spool.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !spool.files().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("spool drained");

        shutdown.cancel();
        let _ = sender_task.await;
        let _ = channel_task.await;
    }

    #[tokio::test]
    async fn send_failure_pauses_drain_and_keeps_order() {
        let (transport, _remote) = mock_channel_pair();
        let (channel, handles) = CommandChannel::new(transport);
        // Never run the channel: every bulk send fails immediately, as it
        // would during an outage.
        drop(channel);

        let spool = Arc::new(MemorySpool::new());
        spool.write("qan", serde_json::json!({"n": 1})).unwrap();
        spool.write("qan", serde_json::json!({"n": 2})).unwrap();

        let status = Arc::new(StatusRegistry::new(&[STATUS_KEY]));
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let sender = Sender::new(spool.clone(), handles.data.clone(), tick_rx, status.clone());
        let sender_task = tokio::spawn(sender.run(shutdown.clone()));

        tick_tx.send(chrono::Utc::now()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while !status.get(STATUS_KEY).starts_with("Error") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sender records the error");

        // Nothing was removed; the next successful pass resumes in order.
        assert_eq!(spool.files().len(), 2);

        shutdown.cancel();
        let _ = sender_task.await;
    }
}
