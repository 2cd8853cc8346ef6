//! Duplex command channel to the control plane.
//!
//! The channel is a long-running background task that owns the transport
//! and pumps three streams on behalf of the agent:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      CommandChannel<T>                        │
//! │                                                               │
//! │   connect ──► serve ──► disconnect ──► backoff ──► connect    │
//! │                 │                                             │
//! │     inbound  Frame::Cmd ──────► commands stream (to agent)    │
//! │     outbound replies   ◄────── replies stream  (from agent)   │
//! │     outbound bulk data ◄────── data stream     (from sender)  │
//! │     disconnects ──────────────► error stream                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport errors are never fatal: the loop reconnects with bounded
//! exponential backoff until shutdown, and the caller never restarts it.
//! Bulk data sends are sequential; each resolves to an ack or a transport
//! error through its own oneshot.

mod mock;
mod socket;

pub use mock::{mock_channel_pair, MockRemote, MockTransport};
pub use socket::SocketTransport;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proto::{Cmd, Reply};

/// Capacity of the inbound command stream.
const CMD_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the outbound reply stream.
const REPLY_CHANNEL_CAPACITY: usize = 64;
/// Capacity of the outbound bulk-data stream.
const DATA_CHANNEL_CAPACITY: usize = 8;
/// Capacity of the error stream; overflow drops oldest observations.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Default reconnect backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Errors surfaced by the channel. All are retried internally; the error
/// stream exists so the agent can observe disconnects, not react to them.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("frame codec: {0}")]
    Codec(String),
    #[error("channel shut down")]
    Shutdown,
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// One wire frame. The `Cmd`/`Reply` payloads keep the protocol's exact
/// field names; the frame envelope distinguishes the three streams that
/// share the duplex connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Payload")]
pub enum Frame {
    Cmd(Cmd),
    Reply(Reply),
    Data(DataFrame),
}

/// A bulk-data frame: opaque spooled bytes plus their serializer tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataFrame {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Inbound half of a connection.
pub trait ConnectionReader: Send + 'static {
    /// Receives the next frame; `Ok(None)` means the peer closed cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Frame>, ChannelError>> + Send;
}

/// Outbound half of a connection.
pub trait ConnectionWriter: Send + 'static {
    /// Sends one frame; returning `Ok` acknowledges the write was flushed.
    fn send(&mut self, frame: Frame) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// One established connection, splittable into independent halves.
pub trait Connection: Send + 'static {
    type Reader: ConnectionReader;
    type Writer: ConnectionWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

/// Connection factory: a dialable endpoint.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, ChannelError>> + Send;
}

struct DataSend {
    frame: DataFrame,
    ack: oneshot::Sender<Result<(), ChannelError>>,
}

/// Cloneable handle for sequential bulk-data sends.
#[derive(Clone)]
pub struct DataSender {
    tx: mpsc::Sender<DataSend>,
}

impl DataSender {
    /// Sends one data frame and waits for its ack.
    pub async fn send(&self, frame: DataFrame) -> Result<(), ChannelError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(DataSend {
                frame,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ChannelError::Shutdown)?;
        ack_rx.await.map_err(|_| ChannelError::Shutdown)?
    }
}

/// The agent-facing ends of the channel's streams.
pub struct ChannelHandles {
    /// Inbound commands in arrival order.
    pub commands: mpsc::Receiver<Cmd>,
    /// Outbound replies.
    pub replies: mpsc::Sender<Reply>,
    /// Outbound bulk data with per-send acks.
    pub data: DataSender,
    /// Disconnect / transport error observations.
    pub errors: mpsc::Receiver<ChannelError>,
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// The channel daemon. Generic over the transport so the in-memory mock
/// drops in for tests without real I/O.
pub struct CommandChannel<T: Transport> {
    transport: T,
    cmd_tx: mpsc::Sender<Cmd>,
    reply_rx: mpsc::Receiver<Reply>,
    data_rx: mpsc::Receiver<DataSend>,
    err_tx: mpsc::Sender<ChannelError>,
    backoff: Backoff,
}

impl<T: Transport> CommandChannel<T> {
    /// Creates the channel and its agent-facing handles.
    pub fn new(transport: T) -> (Self, ChannelHandles) {
        Self::with_backoff(transport, BACKOFF_BASE, BACKOFF_MAX)
    }

    /// Creates the channel with custom backoff bounds.
    pub fn with_backoff(transport: T, base: Duration, max: Duration) -> (Self, ChannelHandles) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(DATA_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);

        let channel = Self {
            transport,
            cmd_tx,
            reply_rx,
            data_rx,
            err_tx,
            backoff: Backoff::new(base, max),
        };
        let handles = ChannelHandles {
            commands: cmd_rx,
            replies: reply_tx,
            data: DataSender { tx: data_tx },
            errors: err_rx,
        };
        (channel, handles)
    }

    /// Runs the connect→serve loop until shutdown.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match self.transport.connect().await {
                Ok(conn) => {
                    self.backoff.reset();
                    info!("control-plane connection established");
                    match self.serve(conn, &shutdown).await {
                        Ok(()) => {
                            debug!("channel shutting down");
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "control-plane connection lost");
                            let _ = self.err_tx.try_send(e);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "connect failed");
                    let _ = self.err_tx.try_send(e);
                }
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Serves one connection until it fails or shutdown fires.
    async fn serve(
        &mut self,
        conn: T::Conn,
        shutdown: &CancellationToken,
    ) -> Result<(), ChannelError> {
        let (mut reader, mut writer) = conn.split();
        let Self {
            cmd_tx,
            reply_rx,
            data_rx,
            ..
        } = self;

        // A dropped agent-side handle closes its stream; the channel keeps
        // serving the remaining streams rather than tearing down.
        let mut replies_open = true;
        let mut data_open = true;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),

                reply = reply_rx.recv(), if replies_open => {
                    match reply {
                        Some(reply) => writer.send(Frame::Reply(reply)).await?,
                        None => replies_open = false,
                    }
                }

                send = data_rx.recv(), if data_open => {
                    match send {
                        Some(send) => {
                            let result = writer.send(Frame::Data(send.frame)).await;
                            let failed = result.clone();
                            let _ = send.ack.send(result);
                            failed?;
                        }
                        None => data_open = false,
                    }
                }

                frame = reader.recv() => match frame? {
                    Some(Frame::Cmd(cmd)) => {
                        if cmd_tx.send(cmd).await.is_err() {
                            return Ok(());
                        }
                    }
                    Some(_) => debug!("ignoring unexpected inbound frame"),
                    None => return Err(ChannelError::Closed),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cmd(verb: &str, id: u64) -> Cmd {
        Cmd {
            id,
            cmd: verb.into(),
            ..Cmd::default()
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(8));
        assert_eq!(b.next_delay(), Duration::from_secs(8));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn frame_wire_shape() {
        let frame = Frame::Cmd(cmd("Status", 3));
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["Type"], "Cmd");
        assert_eq!(json["Payload"]["Cmd"], "Status");

        let back: Frame = serde_json::from_value(json).unwrap();
        assert!(matches!(back, Frame::Cmd(c) if c.id == 3));
    }

    #[tokio::test]
    async fn commands_flow_in_arrival_order() {
        let (transport, remote) = mock_channel_pair();
        let (channel, mut handles) = CommandChannel::new(transport);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(channel.run(shutdown.clone()));

        remote.send_cmd(cmd("Status", 1)).await;
        remote.send_cmd(cmd("StartService", 2)).await;

        let first = tokio::time::timeout(Duration::from_secs(1), handles.commands.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), handles.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn replies_reach_the_remote() {
        let (transport, mut remote) = mock_channel_pair();
        let (channel, handles) = CommandChannel::new(transport);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(channel.run(shutdown.clone()));

        handles
            .replies
            .send(Reply {
                id: 7,
                cmd: "Status".into(),
                error: String::new(),
                data: serde_json::Value::Null,
            })
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), remote.recv_reply())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, 7);

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn data_send_is_acked() {
        let (transport, mut remote) = mock_channel_pair();
        let (channel, handles) = CommandChannel::new(transport);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(channel.run(shutdown.clone()));

        let frame = DataFrame {
            content_type: "json".into(),
            body: b"{}".to_vec(),
        };
        handles.data.send(frame).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), remote.recv_frame())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(got, Frame::Data(d) if d.content_type == "json"));

        shutdown.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn disconnect_surfaces_error_then_reconnects() {
        let (transport, mut remote) = mock_channel_pair();
        let (channel, mut handles) = CommandChannel::with_backoff(
            transport,
            Duration::from_millis(20),
            Duration::from_millis(100),
        );

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(channel.run(shutdown.clone()));

        remote.wait_connects(1).await;
        remote.disconnect();

        let err = tokio::time::timeout(Duration::from_secs(1), handles.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ChannelError::Closed));

        // The channel reconnects on its own and serves commands again.
        remote.wait_connects(2).await;
        remote.send_cmd(cmd("Status", 9)).await;
        let got = tokio::time::timeout(Duration::from_secs(1), handles.commands.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id, 9);

        shutdown.cancel();
        let _ = task.await;
    }
}
