use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::revtun::tunnel::{
    links::{LinkEnds, LinkTable},
    protocol::{Message, RELAY_CHUNK_BYTES},
    transport::MessageWriter,
};

/// Which process a relay worker runs in; used for logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Server => "server",
            Side::Client => "client",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// Our socket hit EOF.
    Eof,
    /// Our socket failed on read or write.
    SocketError,
    /// The peer closed the connection, or the session tore it down.
    Stopped,
    /// The control connection could not carry our data any more.
    ControlLost,
}

/// Bridges one physical socket to one logical connection until either side ends it.
///
/// Socket reads become `Data` frames on `control`. Chunks queued in the link table
/// are written to the socket by a dedicated writer task, which is the only writer
/// for this socket. Whoever removes the link from `links` notifies the peer.
pub async fn run(
    stream: TcpStream,
    ends: LinkEnds,
    links: Arc<LinkTable>,
    control: MessageWriter,
    side: Side,
) -> RelayEnd {
    let LinkEnds {
        id,
        mut rx,
        mut stop,
    } = ends;
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();

    let writer = {
        let links = links.clone();
        let control = control.clone();
        let id = id.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if let Err(err) = wr.write_all(&chunk).await {
                    tracing::debug!(side=side.as_str(), conn=%id, err=%err, "relay: socket write failed");
                    if links.remove(&id).await {
                        control.send_close(&id).await;
                    }
                    return true;
                }
                metrics::counter!("revtun_relay_bytes_total", "side" => side.as_str(), "direction" => "to_socket")
                    .increment(chunk.len() as u64);
            }
            // Queue closed: the link is gone and everything queued before that is flushed.
            let _ = wr.shutdown().await;
            false
        })
    };

    let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
    let mut end = loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break RelayEnd::Stopped,
            res = rd.read(&mut buf) => match res {
                Ok(0) => break RelayEnd::Eof,
                Ok(n) => {
                    let msg = Message::Data {
                        connection_id: id.clone(),
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if let Err(err) = control.send(&msg).await {
                        tracing::debug!(side=side.as_str(), conn=%id, err=%err, "relay: control send failed");
                        break RelayEnd::ControlLost;
                    }
                    metrics::counter!("revtun_relay_bytes_total", "side" => side.as_str(), "direction" => "to_tunnel")
                        .increment(n as u64);
                }
                Err(err) => {
                    tracing::debug!(side=side.as_str(), conn=%id, err=%err, "relay: socket read failed");
                    break RelayEnd::SocketError;
                }
            }
        }
    };

    match end {
        RelayEnd::Eof | RelayEnd::SocketError => {
            if links.remove(&id).await {
                control.send_close(&id).await;
            }
        }
        RelayEnd::ControlLost => {
            links.remove(&id).await;
        }
        RelayEnd::Stopped => {}
    }

    if let Ok(true) = writer.await {
        if end == RelayEnd::Stopped {
            end = RelayEnd::SocketError;
        }
    }
    end
}
