//! Environment-driven configuration for the front end.
//!
//! Every setting has a default; `PIPEBRIDGE_*` variables override it.
//!
//! | Variable | Default |
//! |---|---|
//! | `PIPEBRIDGE_PIPE_NAME` | `pipebridge-<pid>` |
//! | `PIPEBRIDGE_SOCKET_DIR` | see [`default_socket_dir`] |
//! | `PIPEBRIDGE_WORKER` | `pipebridge-worker` |
//! | `PIPEBRIDGE_HOME` | unset |
//! | `PIPEBRIDGE_CONSOLE` | `pipebridge-console` |
//! | `PIPEBRIDGE_CONSOLE_ARGS` | none |
//! | `PIPEBRIDGE_DEV_FLAGS` | `0` |
//! | `PIPEBRIDGE_STARTUP` | none |

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::ipc::{Endpoints, Retry};

const DEFAULT_WORKER: &str = "pipebridge-worker";
const DEFAULT_CONSOLE: &str = "pipebridge-console";

/// Resolve the default directory for channel sockets.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR` (Linux standard)
/// 2. The platform cache directory (`~/Library/Caches` on macOS)
/// 3. `/tmp` (fallback)
pub fn default_socket_dir() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir);
    }

    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir;
    }

    PathBuf::from("/tmp")
}

/// Front-end configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Shared base name of all channels.
    pub pipe_name: String,
    pub socket_dir: PathBuf,
    /// Worker executable.
    pub worker_command: PathBuf,
    /// Interpreter home; `<home>/bin` is prepended to the worker's `PATH`.
    pub interpreter_home: Option<PathBuf>,
    /// Console executable and leading arguments.
    pub console_command: PathBuf,
    pub console_args: Vec<OsString>,
    /// Developer flags; non-zero starts a console alongside the worker.
    pub dev_flags: u32,
    /// Code posted to the worker right after connecting.
    pub startup_code: Vec<String>,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
}

impl Config {
    /// Defaults for channel `pipe_name` under `socket_dir`.
    pub fn new(pipe_name: impl Into<String>, socket_dir: impl Into<PathBuf>) -> Self {
        let retry = Retry::default();
        Self {
            pipe_name: pipe_name.into(),
            socket_dir: socket_dir.into(),
            worker_command: PathBuf::from(DEFAULT_WORKER),
            interpreter_home: None,
            console_command: PathBuf::from(DEFAULT_CONSOLE),
            console_args: Vec::new(),
            dev_flags: 0,
            startup_code: Vec::new(),
            connect_attempts: retry.attempts,
            connect_delay: retry.delay,
        }
    }

    /// Build from `PIPEBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let pipe_name = std::env::var("PIPEBRIDGE_PIPE_NAME")
            .unwrap_or_else(|_| format!("pipebridge-{}", std::process::id()));
        let socket_dir = std::env::var_os("PIPEBRIDGE_SOCKET_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_socket_dir);
        let mut config = Self::new(pipe_name, socket_dir);

        if let Some(worker) = std::env::var_os("PIPEBRIDGE_WORKER") {
            config.worker_command = PathBuf::from(worker);
        }
        config.interpreter_home = std::env::var_os("PIPEBRIDGE_HOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from);
        if let Some(console) = std::env::var_os("PIPEBRIDGE_CONSOLE") {
            config.console_command = PathBuf::from(console);
        }
        if let Ok(args) = std::env::var("PIPEBRIDGE_CONSOLE_ARGS") {
            config.console_args = args.split_whitespace().map(OsString::from).collect();
        }
        if let Ok(flags) = std::env::var("PIPEBRIDGE_DEV_FLAGS") {
            config.dev_flags = flags.trim().parse().unwrap_or_else(|_| {
                warn!("Ignoring invalid PIPEBRIDGE_DEV_FLAGS value {:?}", flags);
                0
            });
        }
        if let Some(path) = std::env::var_os("PIPEBRIDGE_STARTUP") {
            config.startup_code = read_startup_code(Path::new(&path));
        }
        config
    }

    pub fn endpoints(&self) -> Endpoints {
        Endpoints::new(&self.socket_dir, &self.pipe_name)
    }

    pub fn retry(&self) -> Retry {
        Retry {
            attempts: self.connect_attempts,
            delay: self.connect_delay,
        }
    }
}

/// Read a startup file line by line; an unreadable file is logged and
/// yields no code.
fn read_startup_code(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => text.lines().map(str::to_string).collect(),
        Err(e) => {
            warn!("Failed to read startup code {}: {}", path.display(), e);
            Vec::new()
        }
    }
}
