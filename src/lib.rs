//! pipebridge: call/callback transport between a host application and an
//! interpreter worker process.
//!
//! - `ipc` - framing, the front-end call engine and callback dispatch
//! - `worker` - the worker's channel pool and REPL loop
//! - `host` - the front end the host application embeds
//! - `process` - worker and console process lifecycle
//! - `watcher` - directory change notifications for the host
//!
//! ```ignore
//! use pipebridge::config::Config;
//! use pipebridge::host::FrontEnd;
//! use pipebridge::message::{FunctionCall, Payload};
//!
//! let front = FrontEnd::start(Config::from_env(), host_callbacks)?;
//! let reply = front.call(
//!     Payload::FunctionCall(FunctionCall { function: "sum".into(), arguments: vec![1.into(), 2.into()] }),
//!     true,
//! );
//! ```

pub mod config;
pub mod host;
pub mod interpreter;
pub mod ipc;
pub mod message;
pub mod process;
#[cfg(feature = "python")]
pub mod python;
pub mod watcher;
pub mod worker;
