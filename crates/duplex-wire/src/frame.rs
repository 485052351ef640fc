//! Wire framing and the message envelope.
//!
//! Stream transports (TCP, pipes) prefix every frame with a 4-byte big-endian
//! length header. Datagram transports carry exactly one frame per datagram.
//!
//! Inside a frame sits an [`Envelope`]:
//!
//! ```text
//! version u8 | dispatch u8 | outcome u8 | correlation u64 | tag_len u16 | tag | payload
//! ```

use crate::error::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 1;

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Fixed header length before the tag bytes.
const HEADER_LEN: usize = 1 + 1 + 1 + 8 + 2;

/// Classification of a message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dispatch {
    /// One leg of the handshake.
    Handshake,
    /// A request that the peer answers with a response.
    Request,
    /// The answer to a request; echoes the request's correlation id.
    Response,
    /// One-way message, no answer expected.
    Command,
}

impl Dispatch {
    fn to_byte(self) -> u8 {
        match self {
            Self::Handshake => 0,
            Self::Request => 1,
            Self::Response => 2,
            Self::Command => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Handshake),
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Command),
            _ => None,
        }
    }
}

impl std::fmt::Display for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => write!(f, "handshake"),
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// A decoded frame: type tag, dispatch class, correlation id and the
/// serializer-produced payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub dispatch: Dispatch,
    /// Handshake outcome code; zero outside the handshake.
    pub outcome: u8,
    /// Request/response correlation id; zero for commands and handshake legs.
    pub correlation: u64,
    pub tag: String,
    pub payload: Bytes,
}

/// The routing part of an envelope, without the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub dispatch: Dispatch,
    pub correlation: u64,
    pub tag: String,
}

impl Envelope {
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            dispatch: self.dispatch,
            correlation: self.correlation,
            tag: self.tag.clone(),
        }
    }

    /// Encode the envelope into a self-contained buffer.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let tag = self.tag.as_bytes();
        let tag_len = u16::try_from(tag.len())
            .map_err(|_| WireError::MalformedEnvelope(format!("tag too long: {}", tag.len())))?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + tag.len() + self.payload.len());
        buf.put_u8(ENVELOPE_VERSION);
        buf.put_u8(self.dispatch.to_byte());
        buf.put_u8(self.outcome);
        buf.put_u64(self.correlation);
        buf.put_u16(tag_len);
        buf.put_slice(tag);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode an envelope from a complete frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::MalformedEnvelope(format!(
                "frame of {} bytes is shorter than the {HEADER_LEN}-byte header",
                frame.len()
            )));
        }

        let version = frame.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(WireError::MalformedEnvelope(format!(
                "unsupported envelope version {version}"
            )));
        }
        let dispatch_byte = frame.get_u8();
        let dispatch = Dispatch::from_byte(dispatch_byte).ok_or_else(|| {
            WireError::MalformedEnvelope(format!("unknown dispatch code {dispatch_byte}"))
        })?;
        let outcome = frame.get_u8();
        let correlation = frame.get_u64();
        let tag_len = frame.get_u16() as usize;
        if frame.len() < tag_len {
            return Err(WireError::MalformedEnvelope(format!(
                "tag length {tag_len} exceeds remaining {} bytes",
                frame.len()
            )));
        }
        let tag_bytes = frame.split_to(tag_len);
        let tag = std::str::from_utf8(&tag_bytes)
            .map_err(|e| WireError::MalformedEnvelope(format!("tag is not UTF-8: {e}")))?
            .to_string();

        Ok(Self {
            dispatch,
            outcome,
            correlation,
            tag,
            payload: frame,
        })
    }
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Write a framed message (4-byte length + body) to a byte stream.
pub async fn write_frame<W>(writer: &mut W, body: &[u8], max: u32) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    if len > max {
        return Err(WireError::MessageTooLarge { size: len, max });
    }
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(body);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + body) from a byte stream.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<Option<Bytes>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        return Err(WireError::MessageTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(Bytes::from(body))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(WireError::ConnectionClosed)
        }
        Err(e) => Err(WireError::Io(e)),
    }
}
