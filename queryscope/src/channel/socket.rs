//! TCP transport: one JSON frame per line.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use super::{ChannelError, Connection, ConnectionReader, ConnectionWriter, Frame, Transport};

/// Upper bound on one serialized frame. Reports can be large but a frame
/// beyond this is a protocol violation, not data.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Dialable TCP endpoint.
pub struct SocketTransport {
    addr: String,
}

impl SocketTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

impl Transport for SocketTransport {
    type Conn = SocketConnection;

    async fn connect(&self) -> Result<SocketConnection, ChannelError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(SocketConnection { stream })
    }
}

/// An established TCP connection.
#[derive(Debug)]
pub struct SocketConnection {
    stream: TcpStream,
}

impl Connection for SocketConnection {
    type Reader = SocketReader;
    type Writer = SocketWriter;

    fn split(self) -> (SocketReader, SocketWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            SocketReader {
                framed: FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
            },
            SocketWriter {
                framed: FramedWrite::new(
                    write_half,
                    LinesCodec::new_with_max_length(MAX_FRAME_LEN),
                ),
            },
        )
    }
}

pub struct SocketReader {
    framed: FramedRead<OwnedReadHalf, LinesCodec>,
}

impl ConnectionReader for SocketReader {
    async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(ChannelError::Transport(e.to_string())),
            Some(Ok(line)) => serde_json::from_str(&line)
                .map(Some)
                .map_err(|e| ChannelError::Codec(e.to_string())),
        }
    }
}

pub struct SocketWriter {
    framed: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

impl ConnectionWriter for SocketWriter {
    async fn send(&mut self, frame: Frame) -> Result<(), ChannelError> {
        let line = serde_json::to_string(&frame).map_err(|e| ChannelError::Codec(e.to_string()))?;
        self.framed
            .send(line)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}
