//! Length-prefixed JSON framing.
//!
//! Every frame is a 4-byte big-endian payload length followed by a JSON
//! document whose top level must be an object. The prefix makes frames
//! self-delimiting, so [`decode`] can be called repeatedly on a buffer that
//! is fed by partial socket reads.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Upper bound on a single payload unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// A decoded frame: a mapping of field names to JSON values.
pub type Message = Map<String, Value>;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("incomplete frame: {needed} more bytes required")]
    IncompleteFrame { needed: usize },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("payload is not a mapping")]
    NotAMapping,

    /// Outgoing payload the receiving side would refuse.
    #[error("payload of {len} bytes exceeds frame limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },
}

impl FramingError {
    /// True when the caller should keep buffering instead of failing.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FramingError::IncompleteFrame { .. })
    }
}

/// Serializes `message` into a single frame.
pub fn encode<T>(message: &T) -> Result<Vec<u8>, FramingError>
where
    T: Serialize + ?Sized,
{
    encode_within(message, u32::MAX as usize)
}

/// Like [`encode`], but fails with `FrameTooLarge` when the payload is
/// longer than a peer decoding with `max_frame_len` accepts.
pub fn encode_within<T>(message: &T, max_frame_len: usize) -> Result<Vec<u8>, FramingError>
where
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_vec(message).map_err(|err| FramingError::MalformedPayload(err.to_string()))?;
    if payload.len() > max_frame_len {
        return Err(FramingError::FrameTooLarge {
            len: payload.len(),
            limit: max_frame_len,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| {
        FramingError::MalformedPayload(format!("payload of {} bytes is too large", payload.len()))
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(len);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Removes one complete frame from the front of `buf` and decodes it.
///
/// On `IncompleteFrame` the buffer is left untouched. A frame whose payload
/// fails to decode is still consumed, so the next call starts at the
/// following frame boundary.
pub fn decode(buf: &mut BytesMut, max_frame_len: usize) -> Result<Message, FramingError> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::IncompleteFrame {
            needed: HEADER_LEN - buf.len(),
        });
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_len {
        return Err(FramingError::MalformedPayload(format!(
            "declared length {len} exceeds limit of {max_frame_len}"
        )));
    }

    let available = buf.len() - HEADER_LEN;
    if available < len {
        return Err(FramingError::IncompleteFrame {
            needed: len - available,
        });
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len);
    match serde_json::from_slice::<Value>(&payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(FramingError::NotAMapping),
        Err(err) => Err(FramingError::MalformedPayload(err.to_string())),
    }
}

/// Async frame reader used by the terminal client and the tests.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_limit(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Returns the next frame, or `None` once the peer closes cleanly
    /// between frames.
    pub async fn next_message(&mut self) -> io::Result<Option<Message>> {
        loop {
            match decode(&mut self.buf, self.max_frame_len) {
                Ok(message) => return Ok(Some(message)),
                Err(err) if err.is_incomplete() => {}
                Err(err) => return Err(to_io_error(err)),
            }

            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
        }
    }
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let frame = encode(message).map_err(to_io_error)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: FramingError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame_bytes(payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn decodes_frame_fed_in_pieces() {
        let frame = encode(&json!({"action": "presence", "time": 1.5})).unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap_err().is_incomplete());

        buf.extend_from_slice(&frame[2..frame.len() - 1]);
        let err = decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FramingError::IncompleteFrame { needed: 1 }));

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let message = decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(message["action"], "presence");
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&json!({"n": 1})).unwrap());
        buf.extend_from_slice(&encode(&json!({"n": 2})).unwrap());

        assert_eq!(decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap()["n"], 1);
        assert_eq!(decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap()["n"], 2);
        assert!(decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap_err().is_incomplete());
    }

    #[test]
    fn rejects_invalid_json_and_skips_past_it() {
        let mut buf = frame_bytes(b"{not json");
        buf.extend_from_slice(&encode(&json!({"ok": true})).unwrap());

        let err = decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FramingError::MalformedPayload(_)));
        assert_eq!(decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap()["ok"], true);
    }

    #[test]
    fn rejects_non_mapping_top_level() {
        let mut buf = frame_bytes(b"[1, 2, 3]");
        let err = decode(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap_err();
        assert!(matches!(err, FramingError::NotAMapping));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn rejects_oversized_declared_length() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        let err = decode(&mut buf, 16).unwrap_err();
        assert!(matches!(err, FramingError::MalformedPayload(_)));
    }

    #[test]
    fn encode_refuses_payload_over_receiver_limit() {
        let message = json!({"data_list": ["x".repeat(64)]});
        let err = encode_within(&message, 32).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge { limit: 32, .. }));

        let mut buf = BytesMut::from(&encode_within(&message, 128).unwrap()[..]);
        assert_eq!(decode(&mut buf, 128).unwrap()["data_list"][0], "x".repeat(64));
    }

    #[tokio::test]
    async fn reader_yields_frames_then_clean_eof() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(reader);

        write_frame(&mut writer, &json!({"response": 200})).await.unwrap();
        drop(writer);

        let message = reader.next_message().await.unwrap().expect("one frame");
        assert_eq!(message["response"], 200);
        assert!(reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_reports_truncated_frame() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = FrameReader::new(reader);

        let frame = encode(&json!({"response": 200})).unwrap();
        writer.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(writer);

        let err = reader.next_message().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
