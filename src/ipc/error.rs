//! Transport error types.

use thiserror::Error;

/// Diagnostic carried by the error response to a frame that failed to decode.
pub const FRAME_ERROR_DIAGNOSTIC: &str = "error parsing packet";

/// A frame that could not be turned into a [`Message`](crate::message::Message).
///
/// Frame errors are local to one frame: the channel that carried it stays
/// open and the sender gets an error response.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,

    #[error("frame of {0} bytes is shorter than its length header")]
    ShortHeader(usize),

    #[error("declared length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame length {len} exceeds maximum {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Channel-level errors.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to connect to a peer socket.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// The peer went away.
    #[error("Channel broken: {0}")]
    ChannelBroken(String),

    /// Framing violation that desynchronizes the stream.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// The target channel has no connected peer.
    #[error("Channel not connected")]
    NotConnected,

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => IpcError::ConnectionFailed(err),
            ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
                IpcError::ChannelBroken(err.to_string())
            }
            _ => IpcError::Io(err),
        }
    }
}
