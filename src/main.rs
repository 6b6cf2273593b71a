//! pipebridge worker: runs an embedded Python interpreter behind the
//! worker channels.
//!
//! Launched by the front end as `pipebridge-worker -p <name> [-r <home>]
//! --socket-dir <dir>`. Exits 0 on a requested shutdown and 1 when the
//! primary client goes away.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipebridge::config::default_socket_dir;
use pipebridge::ipc::Endpoints;
use pipebridge::python::PythonInterpreter;
use pipebridge::worker::{Worker, WorkerOptions};

#[derive(Parser, Debug)]
#[command(name = "pipebridge-worker", version, about = "Interpreter worker for pipebridge")]
struct Args {
    /// Base name of the worker channels
    #[arg(short = 'p', long)]
    pipe_name: String,

    /// Interpreter home (PYTHONHOME)
    #[arg(short = 'r', long)]
    home: Option<PathBuf>,

    /// Directory holding the channel sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

/// Configure Python home/path before the interpreter starts.
///
/// An explicit home wins; otherwise `python3` is asked for its
/// `sys.base_prefix` and `sys.path`.
fn configure_python_env(home: Option<&Path>) {
    if let Some(home) = home {
        std::env::set_var("PYTHONHOME", home);
        info!("Using PYTHONHOME={}", home.display());
        return;
    }
    if std::env::var_os("PYTHONHOME").is_some() {
        info!("PYTHONHOME already set; using existing value");
        return;
    }

    let Some(env_info) = query_python_env(Path::new("python3")) else {
        tracing::warn!("Python stdlib not configured; set PYTHONHOME or pass -r");
        return;
    };
    std::env::set_var("PYTHONHOME", &env_info.base_prefix);
    info!("Using PYTHONHOME={}", env_info.base_prefix);

    if std::env::var_os("PYTHONPATH").is_none() && !env_info.path.is_empty() {
        if let Ok(joined) = std::env::join_paths(&env_info.path) {
            std::env::set_var("PYTHONPATH", &joined);
        }
    }
}

struct PythonEnvInfo {
    base_prefix: String,
    path: Vec<String>,
}

fn query_python_env(python_exe: &Path) -> Option<PythonEnvInfo> {
    let script = r#"
import sys, json
print(json.dumps({"base_prefix": sys.base_prefix, "path": [p for p in sys.path if p]}))
"#;

    let output = Command::new(python_exe).args(["-c", script]).output().ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    Some(PythonEnvInfo {
        base_prefix: parsed["base_prefix"].as_str()?.to_string(),
        path: parsed["path"]
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the interpreter.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pipebridge=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    info!("Starting pipebridge worker v{}", env!("CARGO_PKG_VERSION"));

    configure_python_env(args.home.as_deref());
    pyo3::Python::initialize();
    let interp = PythonInterpreter::new()?;

    let socket_dir = args.socket_dir.unwrap_or_else(default_socket_dir);
    let endpoints = Endpoints::new(&socket_dir, &args.pipe_name);
    let mut worker = Worker::start(&endpoints, WorkerOptions::default())
        .with_context(|| format!("Failed to open channels for {}", args.pipe_name))?;

    let exit = worker.serve(&interp)?;
    drop(worker);
    std::process::exit(exit.code());
}
