//! Transport layer shared by the front end, the worker and console clients.
//!
//! # Architecture
//!
//! Every process pair talks over Unix domain sockets addressed by one
//! shared base name:
//!
//! ```text
//! ┌──────────────┐   <name>.sock (primary, slot 1)    ┌─────────────────┐
//! │  Front end   │ ◄────────────────────────────────► │                 │
//! │ (CallEngine) │   <name>-CB.sock (callback, 0)     │     Worker      │
//! │              │ ◄────────────────────────────────► │  (ChannelPool)  │
//! └──────────────┘                                    │                 │
//! ┌──────────────┐   <name>.sock (secondary, 2..)     │                 │
//! │   Console    │ ◄────────────────────────────────► │                 │
//! └──────────────┘   <name>-M.sock (management)       └─────────────────┘
//! ```
//!
//! # Protocol
//!
//! Each message is one length-prefixed JSON frame, see [`framing`].

pub mod callback;
pub mod client;
pub mod error;
pub mod framing;
pub mod registry;

use std::path::{Path, PathBuf};

pub use callback::{CallbackGate, HostCallbacks};
pub use client::{connect_with_retry, request_break, CallEngine, Retry};
pub use error::{FrameError, IpcError, FRAME_ERROR_DIAGNOSTIC};
pub use framing::{decode, encode, read_frame, write_frame, write_message};
pub use registry::TransactionRegistry;

/// Socket paths derived from a shared base name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Primary and secondary clients.
    pub primary: PathBuf,
    /// Worker-to-front-end callbacks.
    pub callback: PathBuf,
    /// Out-of-band control (`break`).
    pub management: PathBuf,
}

impl Endpoints {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            primary: dir.join(format!("{}.sock", name)),
            callback: dir.join(format!("{}-CB.sock", name)),
            management: dir.join(format!("{}-M.sock", name)),
        }
    }
}
