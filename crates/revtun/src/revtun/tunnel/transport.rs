use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::Mutex,
};

use crate::revtun::tunnel::protocol::{self, Message, ProtocolError};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Splits a control connection into its receive and send halves.
///
/// The receive half is owned by the single dispatch loop; the send half is cloned
/// into every relay worker that talks over this connection.
pub fn split(stream: BoxedStream, remote: Option<SocketAddr>) -> (MessageReader, MessageWriter) {
    let (rd, wr) = tokio::io::split(stream);
    (
        MessageReader { inner: rd },
        MessageWriter {
            inner: Arc::new(Mutex::new(wr)),
            remote,
        },
    )
}

pub fn split_tcp(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let _ = stream.set_nodelay(true);
    let remote = stream.peer_addr().ok();
    split(Box::new(stream), remote)
}

pub struct MessageReader {
    inner: ReadHalf<BoxedStream>,
}

impl MessageReader {
    /// Blocks until one complete message arrives.
    pub async fn recv(&mut self) -> Result<Message, ProtocolError> {
        protocol::read_message(&mut self.inner).await
    }
}

/// Send half of a control connection.
///
/// Every frame is written whole while holding the lock, so concurrent senders
/// can never interleave partial frames.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<WriteHalf<BoxedStream>>>,
    remote: Option<SocketAddr>,
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl MessageWriter {
    pub async fn send(&self, msg: &Message) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        let mut w = self.inner.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    /// Best-effort: a failed send only means the session is already going away.
    pub async fn send_close(&self, connection_id: &protocol::ConnectionId) {
        let msg = Message::Close {
            connection_id: connection_id.clone(),
        };
        if let Err(err) = self.send(&msg).await {
            tracing::debug!(conn=%connection_id, err=%err, "tunnel: close notification not delivered");
        }
    }

    pub async fn close(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }
}
