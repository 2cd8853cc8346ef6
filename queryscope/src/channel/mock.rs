//! In-memory transport for tests.
//!
//! [`mock_channel_pair`] yields a [`MockTransport`] for the channel under
//! test and a [`MockRemote`] playing the control plane: inject commands,
//! collect replies and data frames, force disconnects, and observe
//! reconnects. No real I/O is involved.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{ChannelError, Connection, ConnectionReader, ConnectionWriter, Frame, Transport};
use crate::proto::{Cmd, Reply};

/// Creates a connected transport/remote pair.
pub fn mock_channel_pair() -> (MockTransport, MockRemote) {
    let (to_agent_tx, to_agent_rx) = mpsc::channel(64);
    let (from_agent_tx, from_agent_rx) = mpsc::channel(64);
    let (connects_tx, connects_rx) = watch::channel(0usize);

    let shared = Arc::new(Shared {
        to_agent: Mutex::new(to_agent_rx),
        from_agent: from_agent_tx,
        session: StdMutex::new(CancellationToken::new()),
        connects: connects_tx,
        connect_count: AtomicUsize::new(0),
    });

    let transport = MockTransport {
        shared: Arc::clone(&shared),
    };
    let remote = MockRemote {
        to_agent: to_agent_tx,
        from_agent: from_agent_rx,
        shared,
        connects: connects_rx,
    };
    (transport, remote)
}

struct Shared {
    /// Frames flowing remote → agent. One live reader at a time.
    to_agent: Mutex<mpsc::Receiver<Frame>>,
    /// Frames flowing agent → remote.
    from_agent: mpsc::Sender<Frame>,
    /// Kill switch for the current connection.
    session: StdMutex<CancellationToken>,
    connects: watch::Sender<usize>,
    connect_count: AtomicUsize,
}

/// The transport handed to the channel under test.
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Transport for MockTransport {
    type Conn = MockConnection;

    async fn connect(&self) -> Result<MockConnection, ChannelError> {
        let token = CancellationToken::new();
        if let Ok(mut session) = self.shared.session.lock() {
            *session = token.clone();
        }
        let n = self.shared.connect_count.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.shared.connects.send(n);
        Ok(MockConnection {
            shared: Arc::clone(&self.shared),
            closed: token,
        })
    }
}

pub struct MockConnection {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl Connection for MockConnection {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn split(self) -> (MockReader, MockWriter) {
        (
            MockReader {
                shared: Arc::clone(&self.shared),
                closed: self.closed.clone(),
            },
            MockWriter {
                shared: self.shared,
                closed: self.closed,
            },
        )
    }
}

pub struct MockReader {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl ConnectionReader for MockReader {
    async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        let mut rx = self.shared.to_agent.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(ChannelError::Closed),
            frame = rx.recv() => Ok(frame),
        }
    }
}

pub struct MockWriter {
    shared: Arc<Shared>,
    closed: CancellationToken,
}

impl ConnectionWriter for MockWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.shared
            .from_agent
            .send(frame)
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

/// The test's end: acts as the control plane.
pub struct MockRemote {
    to_agent: mpsc::Sender<Frame>,
    from_agent: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
    connects: watch::Receiver<usize>,
}

impl MockRemote {
    /// Injects a command as if the control plane sent it.
    pub async fn send_cmd(&self, cmd: Cmd) {
        let _ = self.to_agent.send(Frame::Cmd(cmd)).await;
    }

    /// Receives the next frame the agent sent, of any kind.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.from_agent.recv().await
    }

    /// Receives the next reply, skipping data frames.
    pub async fn recv_reply(&mut self) -> Option<Reply> {
        loop {
            match self.from_agent.recv().await? {
                Frame::Reply(reply) => return Some(reply),
                _ => continue,
            }
        }
    }

    /// Severs the current connection; the channel will reconnect on its own.
    pub fn disconnect(&self) {
        if let Ok(session) = self.shared.session.lock() {
            session.cancel();
        }
    }

    /// Number of successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    /// Waits until at least `n` connects have happened.
    pub async fn wait_connects(&mut self, n: usize) {
        while *self.connects.borrow() < n {
            if self.connects.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_sees_injected_frames() {
        let (transport, remote) = mock_channel_pair();
        let conn = transport.connect().await.unwrap();
        let (mut reader, _writer) = conn.split();

        remote.send_cmd(Cmd::default()).await;
        let frame = reader.recv().await.unwrap();
        assert!(matches!(frame, Some(Frame::Cmd(_))));
    }

    #[tokio::test]
    async fn disconnect_fails_both_halves() {
        let (transport, remote) = mock_channel_pair();
        let conn = transport.connect().await.unwrap();
        let (mut reader, mut writer) = conn.split();

        remote.disconnect();

        let recv_err = reader.recv().await.unwrap_err();
        assert!(matches!(recv_err, ChannelError::Closed));
        let send_err = writer
            .send(Frame::Reply(Reply::default()))
            .await
            .unwrap_err();
        assert!(matches!(send_err, ChannelError::Closed));
    }

    #[tokio::test]
    async fn reconnect_counts_connects() {
        let (transport, mut remote) = mock_channel_pair();
        let _c1 = transport.connect().await.unwrap();
        remote.disconnect();
        let _c2 = transport.connect().await.unwrap();
        remote.wait_connects(2).await;
        assert_eq!(remote.connect_count(), 2);
    }
}
