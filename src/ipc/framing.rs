//! Length-prefixed message framing over stream sockets.
//!
//! # Wire Format
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 LE)| JSON payload (length bytes)|
//! +----------------+---------------------------+
//! ```
//!
//! A frame, as handled by [`encode`] and [`decode`], is the header plus the
//! payload. The declared length must equal the number of payload bytes.

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ipc::error::{FrameError, IpcError};
use crate::message::Message;

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum payload size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Serialize a message into a complete frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            len: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a complete frame.
///
/// # Errors
///
/// Returns a [`FrameError`] if:
/// - The frame is empty, or declares an empty payload
/// - The frame is shorter than the header
/// - The declared length differs from the payload byte count
/// - The payload is not a message with a recognized tag
pub fn decode(frame: &[u8]) -> Result<Message, FrameError> {
    let body = payload(frame)?;
    Ok(serde_json::from_slice(body)?)
}

fn payload(frame: &[u8]) -> Result<&[u8], FrameError> {
    if frame.is_empty() {
        return Err(FrameError::Empty);
    }
    if frame.len() < HEADER_LEN {
        return Err(FrameError::ShortHeader(frame.len()));
    }

    let (header, body) = frame.split_at(HEADER_LEN);
    let declared = declared_len(header);
    if declared > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            len: declared,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if declared != body.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    if declared == 0 {
        return Err(FrameError::Empty);
    }
    Ok(body)
}

fn declared_len(header: &[u8]) -> usize {
    let mut bytes = [0u8; HEADER_LEN];
    bytes.copy_from_slice(&header[..HEADER_LEN]);
    u32::from_le_bytes(bytes) as usize
}

/// Envelope fields salvaged from a frame whose payload failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Envelope {
    pub id: u32,
    #[serde(default)]
    pub wait: bool,
}

/// Best-effort recovery of `{id, wait}` so an error response can be
/// correlated with the request that caused it.
pub fn recover_envelope(frame: &[u8]) -> Option<Envelope> {
    let body = frame.get(HEADER_LEN..)?;
    serde_json::from_slice(body).ok()
}

/// Read one frame from the stream.
///
/// Reads the header, then exactly the declared number of payload bytes.
/// The returned frame still carries its header so it can go straight to
/// [`decode`].
///
/// # Errors
///
/// EOF maps to [`IpcError::ChannelBroken`]. A declared length above
/// [`MAX_MESSAGE_SIZE`] is terminal for the stream, since the reader can
/// no longer find the next frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, IpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        }
        .into());
    }

    let mut frame = vec![0u8; HEADER_LEN + len];
    frame[..HEADER_LEN].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_LEN..]).await?;
    Ok(frame)
}

/// Write one complete frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write a message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    write_frame(writer, &frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CodeBlock, ConsoleOutput, FunctionCall, Payload};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::UnixStream;
    use tokio::time::timeout;

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn frame_with(declared: u32, body: &[u8]) -> Vec<u8> {
        let mut frame = declared.to_le_bytes().to_vec();
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let messages = [
            Message::new(
                1,
                true,
                Payload::FunctionCall(FunctionCall {
                    function: "sum".into(),
                    arguments: vec![json!(1), json!([2, 3])],
                }),
            ),
            Message::new(2, false, Payload::Code(["a <- 1", "b <- 2"].into_iter().collect())),
            Message::response(3, Payload::Result(json!({"x": 1.5}))),
            Message::unsolicited(Payload::Console(ConsoleOutput::Prompt("> ".into()))),
        ];

        for message in messages {
            let frame = encode(&message).expect("encode");
            assert_eq!(decode(&frame).expect("decode"), message);
        }
    }

    #[test]
    fn test_header_is_little_endian_payload_length() {
        let frame = encode(&Message::error(9, "x")).unwrap();
        let declared = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_decode_rejects_declared_length_mismatch() {
        let frame = frame_with(500, &[b' '; 400]);
        match decode(&frame) {
            Err(FrameError::LengthMismatch { declared, actual }) => {
                assert_eq!(declared, 500);
                assert_eq!(actual, 400);
            }
            other => panic!("expected length mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_short_frames() {
        assert!(matches!(decode(&[]), Err(FrameError::Empty)));
        assert!(matches!(decode(&[1, 0]), Err(FrameError::ShortHeader(2))));
        assert!(matches!(decode(&frame_with(0, b"")), Err(FrameError::Empty)));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let body = br#"{"id":4,"wait":true,"payload":{"telepathy":1}}"#;
        let frame = frame_with(body.len() as u32, body);
        assert!(matches!(decode(&frame), Err(FrameError::Malformed(_))));

        let envelope = recover_envelope(&frame).expect("envelope");
        assert_eq!(envelope, Envelope { id: 4, wait: true });
    }

    #[test]
    fn test_recover_envelope_from_garbage() {
        let frame = frame_with(5, b"%%%%%");
        assert_eq!(recover_envelope(&frame), None);
    }

    #[test]
    fn test_decode_rejects_oversized_declaration() {
        let frame = frame_with((MAX_MESSAGE_SIZE + 1) as u32, b"{}");
        assert!(matches!(decode(&frame), Err(FrameError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().expect("Failed to create socket pair");
        let message = Message::new(
            12,
            true,
            Payload::Code(CodeBlock {
                lines: vec!["print(1)".into()],
            }),
        );

        write_message(&mut a, &message).await.expect("Write failed");
        let frame = timeout(TEST_TIMEOUT, read_frame(&mut b))
            .await
            .expect("Test timed out")
            .expect("Read failed");

        assert_eq!(decode(&frame).unwrap(), message);
    }

    #[tokio::test]
    async fn test_read_waits_for_whole_payload() {
        let (mut a, mut b) = UnixStream::pair().expect("Failed to create socket pair");
        let frame = encode(&Message::error(1, "split")).unwrap();
        let (head, tail) = frame.split_at(6);

        write_frame(&mut a, head).await.unwrap();
        let reader = tokio::spawn(async move { read_frame(&mut b).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        write_frame(&mut a, tail).await.unwrap();

        let received = timeout(TEST_TIMEOUT, reader)
            .await
            .expect("Test timed out")
            .unwrap()
            .expect("Read failed");
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_message() {
        let (mut a, mut b) = UnixStream::pair().expect("Failed to create socket pair");
        let header = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        write_frame(&mut a, &header).await.unwrap();

        let result = timeout(TEST_TIMEOUT, read_frame(&mut b))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(IpcError::Frame(FrameError::TooLarge { .. }))));
    }

    #[tokio::test]
    async fn test_connection_closed_returns_error() {
        let (a, mut b) = UnixStream::pair().expect("Failed to create socket pair");
        drop(a);

        let result = timeout(TEST_TIMEOUT, read_frame(&mut b))
            .await
            .expect("Test timed out");
        assert!(matches!(result, Err(IpcError::ChannelBroken(_))));
    }
}
