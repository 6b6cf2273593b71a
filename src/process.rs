//! Worker and console process lifecycle.
//!
//! Children are placed in a kill-group: on Linux the child asks the kernel
//! for `SIGKILL` when its parent dies (`PR_SET_PDEATHSIG`), so a worker can
//! never outlive the host. Dropping a [`ProcessHandle`] gives the child a
//! short grace period to exit on its own, then kills it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Launch failure, reported once with the OS error code.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        code: Option<i32>,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    /// Raw OS error code, if the OS reported one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SpawnError::Launch { code, .. } => *code,
        }
    }
}

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Prepended to the child's `PATH`.
    pub path_prefix: Option<PathBuf>,
    /// Give the child a null stdin instead of inheriting ours.
    pub null_stdin: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn path_prefix(mut self, dir: impl Into<PathBuf>) -> Self {
        self.path_prefix = Some(dir.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(path) = self.search_path() {
            command.env("PATH", path);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if self.null_stdin {
            command.stdin(Stdio::null());
        }
        command
    }

    /// `PATH` with the prefix in front, or `None` to inherit unchanged.
    fn search_path(&self) -> Option<OsString> {
        let prefix = self.path_prefix.as_ref()?;
        let current = std::env::var_os("PATH").unwrap_or_default();
        let dirs = std::iter::once(prefix.clone()).chain(std::env::split_paths(&current));
        match std::env::join_paths(dirs) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Cannot prepend {} to PATH: {}", prefix.display(), e);
                None
            }
        }
    }
}

/// Launch `spec` in the kill-group. No retry.
pub fn spawn(spec: &LaunchSpec) -> Result<ProcessHandle, SpawnError> {
    let program = spec.program.display().to_string();
    let child = spawn_dying_with_parent(spec.command()).map_err(|source| SpawnError::Launch {
        program: program.clone(),
        code: source.raw_os_error(),
        source,
    })?;
    info!("Started {} (pid {})", program, child.id());
    Ok(ProcessHandle { child, program })
}

#[cfg(target_os = "linux")]
fn spawn_dying_with_parent(mut command: Command) -> io::Result<Child> {
    use std::os::unix::process::CommandExt;

    // SAFETY: prctl(PR_SET_PDEATHSIG) is async-signal-safe
    unsafe {
        command.pre_exec(|| {
            let result = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
            if result != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.spawn()
}

// Elsewhere the handle's Drop is the only kill-group guarantee.
#[cfg(not(target_os = "linux"))]
fn spawn_dying_with_parent(mut command: Command) -> io::Result<Child> {
    command.spawn()
}

/// Worker launch: `-p <name> -r <home> --socket-dir <dir>`.
pub fn worker_spec(config: &Config) -> LaunchSpec {
    let mut spec = LaunchSpec::new(&config.worker_command)
        .arg("-p")
        .arg(&config.pipe_name)
        .arg("--socket-dir")
        .arg(config.socket_dir.as_os_str());
    if let Some(home) = &config.interpreter_home {
        spec = spec.arg("-r").arg(home.as_os_str()).path_prefix(home.join("bin"));
    }
    spec.null_stdin = true;
    spec
}

/// Console launch: configured leading args, then
/// `-p <name> -d <flags> --socket-dir <dir>`.
pub fn console_spec(config: &Config) -> LaunchSpec {
    let mut spec = LaunchSpec::new(&config.console_command);
    spec.args.extend(config.console_args.iter().cloned());
    spec.arg("-p")
        .arg(&config.pipe_name)
        .arg("-d")
        .arg(config.dev_flags.to_string())
        .arg("--socket-dir")
        .arg(config.socket_dir.as_os_str())
}

pub fn start_worker(config: &Config) -> Result<ProcessHandle, SpawnError> {
    spawn(&worker_spec(config))
}

pub fn start_console(config: &Config) -> Result<ProcessHandle, SpawnError> {
    spawn(&console_spec(config))
}

/// A supervised child process.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    program: String,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn program(&self) -> &Path {
        Path::new(&self.program)
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Wait for the child to prevent a zombie, without blocking forever
        for _ in 0..10 {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("{} exited: {}", self.program, status);
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(e) => {
                    warn!("Error waiting for {}: {}", self.program, e);
                    return;
                }
            }
        }

        warn!("{} didn't exit gracefully, killing", self.program);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
