//! Front end embedded in the host application.
//!
//! `FrontEnd` is the one context object the host holds: it starts the
//! worker process, connects the call engine, and owns the console process
//! when one is running. A failed start leaves it in a "not connected" state
//! in which calls answer with an error payload.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::ipc::client::{request_break, CallEngine};
use crate::ipc::error::IpcError;
use crate::ipc::HostCallbacks;
use crate::message::{CodeBlock, Control, Message, Payload, UNSOLICITED_ID};
use crate::process::{self, ProcessHandle, SpawnError};

const NOT_CONNECTED: &str = "not connected to worker";

/// Host-side connection to one worker process.
pub struct FrontEnd {
    config: Config,
    engine: Option<CallEngine>,
    worker: Option<ProcessHandle>,
    console: Option<ProcessHandle>,
    runtime: Runtime,
}

impl FrontEnd {
    /// Start a worker and connect to it.
    ///
    /// Spawn and connect failures are logged and leave the front end
    /// disconnected; only failing to build the I/O runtime is an error.
    pub fn start(config: Config, host: Arc<dyn HostCallbacks>) -> Result<Self, IpcError> {
        let mut front = Self::new(config)?;

        match process::start_worker(&front.config) {
            Ok(worker) => {
                front.worker = Some(worker);
                front.connect(host);
            }
            Err(e) => error!("Worker not started ({:?}): {}", e.os_code(), e),
        }

        if front.is_connected() && front.config.dev_flags != 0 {
            if let Err(e) = front.open_console() {
                warn!("Developer console not started: {}", e);
            }
        }
        Ok(front)
    }

    /// Connect to a worker that is already running on `config`'s channels.
    pub fn attach(config: Config, host: Arc<dyn HostCallbacks>) -> Result<Self, IpcError> {
        let mut front = Self::new(config)?;
        front.connect(host);
        Ok(front)
    }

    fn new(config: Config) -> Result<Self, IpcError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pipebridge-host")
            .enable_all()
            .build()
            .map_err(IpcError::Io)?;
        Ok(Self {
            config,
            engine: None,
            worker: None,
            console: None,
            runtime,
        })
    }

    fn connect(&mut self, host: Arc<dyn HostCallbacks>) {
        let endpoints = self.config.endpoints();
        match CallEngine::connect(self.runtime.handle(), &endpoints, host, self.config.retry()) {
            Ok(engine) => {
                if !self.config.startup_code.is_empty() {
                    let startup: CodeBlock = self.config.startup_code.iter().cloned().collect();
                    if let Some(failed) = engine.call(Payload::Code(startup), false) {
                        warn!("Startup code not sent: {:?}", failed.payload);
                    }
                }
                self.engine = Some(engine);
            }
            Err(e) => error!("Failed to connect to worker: {}", e),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.engine.as_ref().is_some_and(|engine| !engine.is_broken())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Call into the worker. See [`CallEngine::call`].
    ///
    /// Without a connection every call answers with an error payload.
    pub fn call(&self, payload: Payload, block: bool) -> Option<Message> {
        match &self.engine {
            Some(engine) => engine.call(payload, block),
            None => Some(Message::error(UNSOLICITED_ID, NOT_CONNECTED)),
        }
    }

    /// Start a console process attached to this worker.
    pub fn open_console(&mut self) -> Result<(), SpawnError> {
        if self.console.as_mut().is_some_and(ProcessHandle::is_running) {
            info!("Console already running");
            return Ok(());
        }
        self.console = Some(process::start_console(&self.config)?);
        Ok(())
    }

    /// Interrupt the worker's current evaluation.
    pub fn interrupt(&self) -> Result<(), IpcError> {
        let endpoints = self.config.endpoints();
        self.runtime.block_on(request_break(&endpoints.management))
    }

    /// Ask the worker to shut down and release the connection.
    pub fn close(&mut self) {
        if let Some(engine) = self.engine.take() {
            if !engine.is_broken() {
                info!("Shutting down worker");
                let _ = engine.call(Payload::control(Control::Shutdown), false);
            }
        }
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        self.close();
        // Reap the console first; it exits on the worker's shutdown broadcast.
        self.console.take();
        self.worker.take();
    }
}
