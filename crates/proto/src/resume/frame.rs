//! Data-plane frame codec.
//!
//! Once a transport is attached it carries an interleaved stream of
//! length-prefixed frames. All integers are big-endian:
//!
//! ```text
//! u32       body length (1 ..= 32777)
//! u8        frame type
//! DATA  (1): u64 absolute offset, payload bytes
//! ACK   (2): u64 offset
//! CLOSE (3): empty
//! ```
//!
//! DATA offsets are cumulative positions in the sender's byte stream; a
//! payload may be split or coalesced arbitrarily. ACK offsets acknowledge
//! delivery up to (but excluding) the given position. CLOSE marks the
//! orderly end of the sender's direction.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use limpet_platform::{LimpetError, LimpetResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame type byte for DATA.
pub const TYPE_DATA: u8 = 1;
/// Frame type byte for ACK.
pub const TYPE_ACK: u8 = 2;
/// Frame type byte for CLOSE.
pub const TYPE_CLOSE: u8 = 3;

/// Maximum payload carried by a single DATA frame.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Maximum frame body length (type byte + offset + payload).
pub const MAX_FRAME_LEN: usize = 1 + 8 + MAX_DATA_PAYLOAD;

/// A single data-plane frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes starting at the sender's absolute stream offset.
    Data {
        /// Cumulative position of the first payload byte.
        offset: u64,
        /// The payload; at most [`MAX_DATA_PAYLOAD`] bytes.
        payload: Bytes,
    },
    /// The receiver has delivered every byte below `offset` upstream.
    Ack {
        /// Acknowledged position, exclusive.
        offset: u64,
    },
    /// Orderly end of the sender's direction.
    Close,
}

impl Frame {
    /// Serializes the frame, including its length prefix.
    ///
    /// # Example
    ///
    /// ```rust
    /// use limpet_proto::resume::frame::Frame;
    ///
    /// let wire = Frame::Ack { offset: 7 }.encode();
    /// assert_eq!(&wire[..], &[0, 0, 0, 9, 2, 0, 0, 0, 0, 0, 0, 0, 7]);
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + MAX_FRAME_LEN.min(64));
        match self {
            Frame::Data { offset, payload } => {
                debug_assert!(payload.len() <= MAX_DATA_PAYLOAD);
                buf.put_u32((1 + 8 + payload.len()) as u32);
                buf.put_u8(TYPE_DATA);
                buf.put_u64(*offset);
                buf.put_slice(payload);
            }
            Frame::Ack { offset } => {
                buf.put_u32(1 + 8);
                buf.put_u8(TYPE_ACK);
                buf.put_u64(*offset);
            }
            Frame::Close => {
                buf.put_u32(1);
                buf.put_u8(TYPE_CLOSE);
            }
        }
        buf.freeze()
    }

    /// Parses a frame body (everything after the length prefix).
    ///
    /// # Errors
    ///
    /// Returns [`LimpetError::Protocol`] on an unknown type byte or a
    /// truncated body.
    pub fn decode(body: &[u8]) -> LimpetResult<Self> {
        let mut buf = body;
        if buf.is_empty() {
            return Err(LimpetError::Protocol("Empty frame body".to_string()));
        }

        let frame_type = buf.get_u8();
        match frame_type {
            TYPE_DATA => {
                if buf.remaining() < 8 {
                    return Err(LimpetError::Protocol(
                        "DATA frame shorter than its header".to_string(),
                    ));
                }
                let offset = buf.get_u64();
                Ok(Frame::Data {
                    offset,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            TYPE_ACK => {
                if buf.remaining() != 8 {
                    return Err(LimpetError::Protocol(format!(
                        "ACK frame body has {} bytes (expected 9)",
                        body.len()
                    )));
                }
                Ok(Frame::Ack {
                    offset: buf.get_u64(),
                })
            }
            TYPE_CLOSE => {
                if buf.has_remaining() {
                    return Err(LimpetError::Protocol(
                        "CLOSE frame carries unexpected bytes".to_string(),
                    ));
                }
                Ok(Frame::Close)
            }
            other => Err(LimpetError::Protocol(format!(
                "Unknown frame type: {}",
                other
            ))),
        }
    }
}

/// Reads one frame from the transport.
///
/// # Errors
///
/// [`LimpetError::Io`] on transport failure, [`LimpetError::Protocol`] on a
/// malformed frame. Callers treat the two differently: an I/O error detaches
/// the transport, a protocol error destroys the session.
pub async fn read_frame<R>(reader: &mut R) -> LimpetResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 || len > MAX_FRAME_LEN {
        return Err(LimpetError::Protocol(format!(
            "Frame length {} out of range (1..={})",
            len, MAX_FRAME_LEN
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(&body)
}

/// Writes one frame to the transport and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> LimpetResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
