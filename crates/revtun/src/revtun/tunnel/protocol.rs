use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAGIC_AUTH: &[u8; 4] = b"RVTA"; // RevTun Auth
const PROTOCOL_V1: u8 = 1;

const KIND_AUTH: u8 = 1;
const KIND_TUNNEL_OPEN: u8 = 2;
const KIND_DATA: u8 = 3;
const KIND_CLOSE: u8 = 4;

/// Upper bound for a single frame body. Checked before allocating.
pub const MAX_FRAME_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_CONNECTION_ID_BYTES: usize = 64;

/// Read buffer size used by relay workers; one read becomes one `Data` frame.
pub const RELAY_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("frame too large: {0}")]
    FrameTooLarge(u32),
    #[error("truncated frame")]
    Truncated,
    #[error("trailing bytes in frame: {0}")]
    TrailingBytes(usize),
    #[error("varint longer than 5 bytes")]
    VarintTooLong,
    #[error("invalid connection id")]
    InvalidConnectionId,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Opaque join key between the server's public socket and the client's local socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// 8 random bytes rendered as 16 lowercase hex characters.
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 8]>()))
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s.is_empty() || s.len() > MAX_CONNECTION_ID_BYTES {
            return Err(ProtocolError::InvalidConnectionId);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuthBody {
    #[serde(default)]
    secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth {
        secret: String,
    },
    TunnelOpen {
        connection_id: ConnectionId,
        local_port: u16,
    },
    Data {
        connection_id: ConnectionId,
        payload: Bytes,
    },
    Close {
        connection_id: ConnectionId,
    },
}

impl Message {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::TunnelOpen { .. } => "tunnel_open",
            Message::Data { .. } => "data",
            Message::Close { .. } => "close",
        }
    }

    /// Encodes the message as one complete frame so it can be written with a single `write_all`.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut body = BytesMut::new();
        let kind = match self {
            Message::Auth { secret } => {
                body.put_slice(MAGIC_AUTH);
                body.put_u8(PROTOCOL_V1);
                let json = serde_json::to_vec(&AuthBody {
                    secret: secret.clone(),
                })?;
                body.put_slice(&json);
                KIND_AUTH
            }
            Message::TunnelOpen {
                connection_id,
                local_port,
            } => {
                put_varstr(&mut body, connection_id.as_str());
                body.put_u16(*local_port);
                KIND_TUNNEL_OPEN
            }
            Message::Data {
                connection_id,
                payload,
            } => {
                put_varstr(&mut body, connection_id.as_str());
                body.put_slice(payload);
                KIND_DATA
            }
            Message::Close { connection_id } => {
                put_varstr(&mut body, connection_id.as_str());
                KIND_CLOSE
            }
        };

        let n: u32 = body
            .len()
            .try_into()
            .map_err(|_| ProtocolError::FrameTooLarge(u32::MAX))?;
        if n > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(n));
        }

        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(kind);
        frame.put_u32(n);
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    pub fn decode(kind: u8, mut body: Bytes) -> Result<Message, ProtocolError> {
        let msg = match kind {
            KIND_AUTH => {
                if body.remaining() < MAGIC_AUTH.len() + 1 {
                    return Err(ProtocolError::Truncated);
                }
                if &body[..MAGIC_AUTH.len()] != MAGIC_AUTH {
                    return Err(ProtocolError::BadMagic);
                }
                body.advance(MAGIC_AUTH.len());
                let ver = body.get_u8();
                if ver != PROTOCOL_V1 {
                    return Err(ProtocolError::BadVersion(ver));
                }
                let auth: AuthBody = serde_json::from_slice(&body)?;
                body.advance(body.remaining());
                Message::Auth {
                    secret: auth.secret,
                }
            }
            KIND_TUNNEL_OPEN => {
                let connection_id = get_connection_id(&mut body)?;
                if body.remaining() < 2 {
                    return Err(ProtocolError::Truncated);
                }
                let local_port = body.get_u16();
                Message::TunnelOpen {
                    connection_id,
                    local_port,
                }
            }
            KIND_DATA => {
                let connection_id = get_connection_id(&mut body)?;
                let payload = body.split_to(body.remaining());
                Message::Data {
                    connection_id,
                    payload,
                }
            }
            KIND_CLOSE => Message::Close {
                connection_id: get_connection_id(&mut body)?,
            },
            other => return Err(ProtocolError::UnknownKind(other)),
        };

        if body.has_remaining() {
            return Err(ProtocolError::TrailingBytes(body.remaining()));
        }
        Ok(msg)
    }
}

/// Reads exactly one frame from `r`.
pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
    let kind = r.read_u8().await?;
    let n = r.read_u32().await?;
    if n > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(n));
    }
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf).await?;
    Message::decode(kind, Bytes::from(buf))
}

fn put_varstr(out: &mut BytesMut, s: &str) {
    let b = s.as_bytes();
    put_varint(out, b.len() as u32);
    out.put_slice(b);
}

fn get_connection_id(body: &mut Bytes) -> Result<ConnectionId, ProtocolError> {
    let len = get_varint(body)? as usize;
    if len == 0 || len > MAX_CONNECTION_ID_BYTES {
        return Err(ProtocolError::InvalidConnectionId);
    }
    if body.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    let raw = body.split_to(len);
    let s = std::str::from_utf8(&raw).map_err(|_| ProtocolError::InvalidConnectionId)?;
    ConnectionId::parse(s)
}

fn put_varint(out: &mut BytesMut, mut v: u32) {
    loop {
        let mut temp = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            temp |= 0x80;
        }
        out.put_u8(temp);
        if v == 0 {
            break;
        }
    }
}

fn get_varint(body: &mut Bytes) -> Result<u32, ProtocolError> {
    let mut num_read = 0;
    let mut result: u32 = 0;
    loop {
        if !body.has_remaining() {
            return Err(ProtocolError::Truncated);
        }
        let read = body.get_u8();
        result |= ((read & 0x7f) as u32) << (7 * num_read);

        num_read += 1;
        if (read & 0x80) == 0 {
            break;
        }
        if num_read >= 5 {
            return Err(ProtocolError::VarintTooLong);
        }
    }
    Ok(result)
}
