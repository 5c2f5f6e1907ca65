//! Length-delimited message framing.
//!
//! Wire format per message:
//!   [unsigned varint length][protobuf payload]
//!
//! Max message size: 4096 bytes. Larger messages are rejected on both the
//! read and the write path.
//!
//! Reads go through [`MessageReader`], which pulls the stream in chunks and
//! decodes frames out of an internal buffer. Whatever the remote wrote after
//! the last decoded frame is therefore sitting in that buffer, and
//! [`MessageReader::into_parts`] hands it back so a transport can prepend it
//! to the byte stream it exposes upward. Losing those bytes would drop the
//! remote's first application frame.

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single framed message, varint prefix excluded.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Read chunk size. Small enough to keep per-stream memory bounded, large
/// enough to take a whole maximum-size frame in two reads.
const READ_CHUNK: usize = 2048;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit")]
    MessageTooLarge(usize),

    #[error("malformed length prefix")]
    BadLengthPrefix,

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode `msg` with a varint length prefix and write it to `io`.
pub async fn write_message<T, W>(io: &mut W, msg: &T) -> Result<(), ProtoError>
where
    T: Message,
    W: AsyncWrite + Unpin,
{
    let len = msg.encoded_len();
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtoError::MessageTooLarge(len));
    }
    let mut buf = Vec::with_capacity(len + 2);
    msg.encode_length_delimited(&mut buf)
        .expect("Vec<u8> has unbounded capacity");
    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Decode an unsigned varint from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer ends mid-varint, `Ok(Some((value,
/// consumed)))` once a full prefix is available.
fn decode_varint(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtoError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().enumerate() {
        if i >= 10 {
            return Err(ProtoError::BadLengthPrefix);
        }
        value |= u64::from(byte & 0x7f) << (i * 7);
        if byte & 0x80 == 0 {
            if value > usize::MAX as u64 {
                return Err(ProtoError::BadLengthPrefix);
            }
            return Ok(Some((value as usize, i + 1)));
        }
    }
    Ok(None)
}

/// Buffered frame reader over an `AsyncRead`.
pub struct MessageReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(io: R) -> Self {
        MessageReader {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read and decode the next framed message.
    ///
    /// Bytes past the frame stay buffered; see [`MessageReader::into_parts`].
    pub async fn read_message<T>(&mut self) -> Result<T, ProtoError>
    where
        T: Message + Default,
    {
        loop {
            if let Some((len, prefix)) = decode_varint(&self.buf)? {
                if len > MAX_MESSAGE_SIZE {
                    return Err(ProtoError::MessageTooLarge(len));
                }
                if self.buf.len() >= prefix + len {
                    self.buf.advance(prefix);
                    let frame = self.buf.split_to(len).freeze();
                    return Ok(T::decode(frame)?);
                }
            }
            let n = self.io.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(ProtoError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-frame",
                )));
            }
        }
    }

    /// Bytes read off the stream but not consumed by any frame.
    pub fn leftover(&self) -> &[u8] {
        &self.buf
    }

    /// Dismantle the reader into the underlying stream and the leftover
    /// bytes that were read past the last decoded frame.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.io, self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_single_byte() {
        assert_eq!(decode_varint(&[0x05]).unwrap(), Some((5, 1)));
    }

    #[test]
    fn varint_two_bytes() {
        // 300 = 0b1010_1100 0b0000_0010
        assert_eq!(decode_varint(&[0xac, 0x02]).unwrap(), Some((300, 2)));
    }

    #[test]
    fn varint_incomplete() {
        assert_eq!(decode_varint(&[0x80]).unwrap(), None);
        assert_eq!(decode_varint(&[]).unwrap(), None);
    }

    #[test]
    fn varint_overlong_rejected() {
        let overlong = [0x80u8; 11];
        assert!(decode_varint(&overlong).is_err());
    }
}
