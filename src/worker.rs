//! Worker process main loop.
//!
//! The worker owns a [`ChannelPool`] and runs the interpreter on a single
//! thread. Console reads are the only place the loop waits for input:
//!
//! - function calls and code blocks from any client are executed in place,
//!   possibly nested inside another call, and answered when `wait` is set;
//! - a shell command ends the read and hands its text to the REPL;
//! - control messages claim the console, close a client, or shut down.
//!
//! Output that the interpreter produces goes to the designated console
//! client, buffered until one attaches.

pub mod depth;
pub mod management;
pub mod pool;

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, error, info, warn};

use crate::interpreter::Interpreter;
use crate::ipc::callback::panic_message;
use crate::ipc::error::{IpcError, FRAME_ERROR_DIAGNOSTIC};
use crate::ipc::framing::{decode, encode, recover_envelope};
use crate::ipc::registry::TransactionRegistry;
use crate::ipc::Endpoints;
use crate::message::{ConsoleOutput, Control, Message, Payload, UNSOLICITED_ID};

use self::depth::CallDepth;
use self::management::BreakSignal;
use self::pool::{ChannelPool, CloseOutcome, PoolEvent, Role, SlotId, CALLBACK_INDEX};

/// Why the worker loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// A client sent `shutdown`.
    Requested,
    /// The primary client disconnected.
    PrimaryLost,
}

impl Exit {
    /// Process exit code.
    pub fn code(self) -> i32 {
        match self {
            Exit::Requested => 0,
            Exit::PrimaryLost => 1,
        }
    }
}

/// Worker errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to start I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// The loop is shutting down; console reads stop returning input.
    #[error("Worker exiting ({0:?})")]
    Exit(Exit),
}

/// Worker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Idle interval after which the interpreter's tick hook runs.
    pub tick: Duration,
    /// How long to wait for queued output on exit.
    pub flush_timeout: Duration,
    /// How long a callback waits for a callback client that is still
    /// connecting.
    pub connect_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            flush_timeout: Duration::from_secs(1),
            connect_grace: Duration::from_secs(1),
        }
    }
}

/// One worker process' transport and dispatch state.
pub struct Worker {
    pool: ChannelPool,
    registry: TransactionRegistry,
    depth: CallDepth,
    /// Id of the shell command whose response is the next prompt.
    prompt_id: u32,
    /// Set when a nested chain unwound and the console still shows a
    /// nested prompt.
    redraw_prompt: bool,
    /// Messages that arrived while a callback was outstanding.
    deferred: VecDeque<(SlotId, Message)>,
    options: WorkerOptions,
    exit: Option<Exit>,
    user_break: Arc<BreakSignal>,
    endpoints: Endpoints,
    /// Drives the pool's I/O tasks; dropped last.
    _runtime: Runtime,
}

impl Worker {
    /// Bind all channels and block until the primary client connects.
    ///
    /// Opens, in order: the management channel, the callback channel
    /// (slot 0), the primary channel (slot 1, blocking) and the first
    /// secondary listener (slot 2).
    pub fn start(endpoints: &Endpoints, options: WorkerOptions) -> Result<Self, WorkerError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("pipebridge-io")
            .enable_all()
            .build()
            .map_err(WorkerError::Runtime)?;

        let user_break = Arc::new(BreakSignal::default());
        management::spawn(runtime.handle(), &endpoints.management, Arc::clone(&user_break))?;

        let mut pool = ChannelPool::new(runtime.handle().clone());
        pool.open(&endpoints.callback, Role::Callback, false)?;
        info!("Waiting for primary client on {}", endpoints.primary.display());
        pool.open(&endpoints.primary, Role::Primary, true)?;
        pool.open(&endpoints.primary, Role::Secondary, false)?;

        Ok(Self {
            pool,
            registry: TransactionRegistry::new(),
            depth: CallDepth::new(),
            prompt_id: UNSOLICITED_ID,
            redraw_prompt: false,
            deferred: VecDeque::new(),
            options,
            exit: None,
            user_break,
            endpoints: endpoints.clone(),
            _runtime: runtime,
        })
    }

    /// Run the REPL until a client shuts the worker down or the primary
    /// client goes away.
    pub fn serve(&mut self, interp: &dyn Interpreter) -> Result<Exit, WorkerError> {
        if let Some(interrupt) = interp.interrupter() {
            self.user_break.install(interrupt);
        }

        let exit = loop {
            let prompt = interp.prompt();
            match self.read_console(interp, &prompt) {
                Ok(line) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| interp.eval_shell(self, &line))) {
                        let text = panic_message(panic.as_ref());
                        error!("Shell evaluation panicked: {}", text);
                        self.write_console(&format!("{}\n", text), true);
                    }
                }
                Err(WorkerError::Exit(exit)) => break exit,
                Err(e) => return Err(e),
            }
        };

        if !self.flush() {
            warn!("Timed out flushing output before exit");
        }
        info!("Worker exiting: {:?}", exit);
        Ok(exit)
    }

    /// Show `prompt` on the console and block until a shell command arrives.
    ///
    /// Calls that arrive meanwhile are executed in place. May be called
    /// from inside a call, which makes the chain nested: the console prompt
    /// is reset once the outermost call returns.
    pub fn read_console(&mut self, interp: &dyn Interpreter, prompt: &str) -> Result<String, WorkerError> {
        self.check_exit()?;
        self.depth.prompt();
        self.push_console(self.prompt_id, ConsoleOutput::Prompt(prompt.to_string()));

        loop {
            let line = match self.deferred.pop_front() {
                Some((slot, message)) => self.handle(interp, slot, message),
                None => match self.pool.poll(Some(self.options.tick)) {
                    Some(event) => self.on_event(interp, event),
                    None => {
                        interp.tick();
                        None
                    }
                },
            };
            if let Some(line) = line {
                return Ok(line);
            }
            self.check_exit()?;
            if self.redraw_prompt && self.depth.depth() == 0 {
                self.redraw_prompt = false;
                self.push_console(self.prompt_id, ConsoleOutput::Prompt(prompt.to_string()));
            }
        }
    }

    /// Call back into the front end and wait for its answer.
    ///
    /// Calls arriving from clients while waiting are executed nested; other
    /// input is held until the next console read. Fails immediately when
    /// the callback channel is not connected.
    pub fn callback(&mut self, interp: &dyn Interpreter, payload: Payload) -> Message {
        let id = self.registry.next_id();
        if !self.pool.wait_connected(CALLBACK_INDEX, self.options.connect_grace) {
            return Message::error(id, "callback channel not connected");
        }

        let request = Message::new(id, true, payload);
        let sent = encode(&request)
            .map_err(IpcError::from)
            .and_then(|frame| self.pool.push_write(CALLBACK_INDEX, frame));
        if let Err(e) = sent {
            return Message::error(id, e.to_string());
        }

        loop {
            let Some(event) = self.pool.poll(None) else {
                continue;
            };
            match event {
                PoolEvent::Frame { slot, frame } if slot.index == CALLBACK_INDEX => match decode(&frame) {
                    Ok(reply) if reply.id == id => return reply,
                    Ok(reply) => debug!("Dropping stale callback response {}", reply.id),
                    Err(e) => {
                        warn!("Undecodable callback response: {}", e);
                        return Message::error(id, FRAME_ERROR_DIAGNOSTIC);
                    }
                },
                PoolEvent::Frame { slot, frame } => {
                    let Some(message) = self.decode_or_reject(slot, &frame) else {
                        continue;
                    };
                    if matches!(message.payload, Payload::FunctionCall(_) | Payload::Code(_)) {
                        self.handle(interp, slot, message);
                    } else {
                        self.deferred.push_back((slot, message));
                    }
                }
                PoolEvent::Broken { slot, reason } => {
                    self.close_client(slot.index, &reason);
                    if slot.index == CALLBACK_INDEX {
                        return Message::error(id, format!("callback channel broken: {}", reason));
                    }
                    if let Some(exit) = self.exit {
                        return Message::error(id, format!("worker exiting ({:?})", exit));
                    }
                }
                PoolEvent::Connected(slot) => debug!("Slot {} connected during callback", slot.index),
            }
        }
    }

    /// Write interpreter output to the console.
    pub fn write_console(&mut self, text: &str, is_err: bool) {
        let output = if is_err {
            ConsoleOutput::Err(text.to_string())
        } else {
            ConsoleOutput::Text(text.to_string())
        };
        self.push_console(UNSOLICITED_ID, output);
    }

    /// Forward an opaque graphics command to the console.
    pub fn push_graphics(&mut self, command: serde_json::Value) {
        self.push_console(UNSOLICITED_ID, ConsoleOutput::Graphics(command));
    }

    /// Wait for queued output to reach the clients.
    pub fn flush(&mut self) -> bool {
        self.pool.flush(self.options.flush_timeout)
    }

    /// Consume a pending user break from the management channel.
    pub fn break_requested(&self) -> bool {
        self.user_break.take()
    }

    pub fn call_depth(&self) -> u32 {
        self.depth.depth()
    }

    fn check_exit(&self) -> Result<(), WorkerError> {
        match self.exit {
            Some(exit) => Err(WorkerError::Exit(exit)),
            None => Ok(()),
        }
    }

    fn on_event(&mut self, interp: &dyn Interpreter, event: PoolEvent) -> Option<String> {
        match event {
            PoolEvent::Connected(slot) => {
                debug!("Slot {} ready", slot.index);
                None
            }
            PoolEvent::Broken { slot, reason } => {
                self.close_client(slot.index, &reason);
                None
            }
            PoolEvent::Frame { slot, frame } => {
                let message = self.decode_or_reject(slot, &frame)?;
                self.handle(interp, slot, message)
            }
        }
    }

    /// Decode a frame, answering undecodable ones with an error unless the
    /// sender asked for no response.
    fn decode_or_reject(&mut self, slot: SlotId, frame: &[u8]) -> Option<Message> {
        match decode(frame) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Undecodable frame on slot {}: {}", slot.index, e);
                let envelope = recover_envelope(frame);
                if envelope.map_or(true, |env| env.wait) {
                    let id = envelope.map_or(UNSOLICITED_ID, |env| env.id);
                    self.respond(slot, Message::error(id, FRAME_ERROR_DIAGNOSTIC));
                }
                None
            }
        }
    }

    /// Dispatch one message. Returns the line of a shell command.
    fn handle(&mut self, interp: &dyn Interpreter, slot: SlotId, message: Message) -> Option<String> {
        let Message { id, wait, payload } = message;
        match payload {
            Payload::FunctionCall(call) => {
                self.execute(slot, id, wait, |worker| interp.call_function(worker, &call));
            }
            Payload::Code(code) => {
                self.execute(slot, id, wait, |worker| interp.exec_code(worker, &code));
            }
            Payload::ShellCommand(line) => {
                self.prompt_id = id;
                return Some(line);
            }
            Payload::ControlMessage(text) => self.control(slot, id, wait, &text),
            other => {
                warn!("Unexpected {} message on slot {}", other.tag(), slot.index);
                if wait {
                    self.respond(slot, Message::error(id, format!("unexpected {} message", other.tag())));
                }
            }
        }
        None
    }

    fn execute(&mut self, slot: SlotId, id: u32, wait: bool, run: impl FnOnce(&mut Worker) -> Payload) {
        self.depth.enter();
        let payload = catch_unwind(AssertUnwindSafe(|| run(self))).unwrap_or_else(|panic| {
            let text = panic_message(panic.as_ref());
            error!("Call {} panicked: {}", id, text);
            Payload::Error(text)
        });
        let unwind = self.depth.exit();

        if wait {
            self.respond(slot, Message::response(id, payload));
        }
        if unwind.is_some() {
            self.reset_prompt();
        }
    }

    fn control(&mut self, slot: SlotId, id: u32, wait: bool, text: &str) {
        match Control::parse(text) {
            Control::Shutdown => {
                info!("Shutdown requested by slot {}", slot.index);
                if wait {
                    self.respond(slot, Message::response(id, Payload::Result(serde_json::Value::Null)));
                }
                self.broadcast(Control::Shutdown);
                self.exit.get_or_insert(Exit::Requested);
            }
            Control::Console => match self.pool.designate_console(slot.index) {
                Ok(claimed) => {
                    if claimed {
                        info!("Slot {} is now the console", slot.index);
                    } else {
                        info!("Console client already set; slot {} stays a plain client", slot.index);
                    }
                    if wait {
                        self.respond(slot, Message::response(id, Payload::Result(serde_json::Value::Null)));
                    }
                }
                Err(e) => {
                    warn!("Slot {} cannot become the console: {}", slot.index, e);
                    if wait {
                        self.respond(slot, Message::error(id, e.to_string()));
                    }
                }
            },
            Control::Close => self.close_client(slot.index, "client requested close"),
            Control::Break | Control::ResetPrompt | Control::Unknown => {
                warn!("Unexpected control message {:?} on slot {}", text, slot.index);
                if wait {
                    self.respond(slot, Message::error(id, format!("unexpected control message {:?}", text)));
                }
            }
        }
    }

    fn close_client(&mut self, index: usize, reason: &str) {
        match self.pool.close(index) {
            CloseOutcome::Fatal => {
                error!("Primary client lost ({}), shutting down", reason);
                self.broadcast(Control::Shutdown);
                self.exit.get_or_insert(Exit::PrimaryLost);
            }
            CloseOutcome::CallbackLost => warn!("Callback channel lost ({}); callbacks will fail", reason),
            CloseOutcome::Released => info!("Client on slot {} closed ({})", index, reason),
        }
    }

    fn respond(&mut self, slot: SlotId, message: Message) {
        if !self.pool.is_current(slot) {
            debug!("Dropping response {} for departed client on slot {}", message.id, slot.index);
            return;
        }
        let sent = encode(&message)
            .map_err(IpcError::from)
            .and_then(|frame| self.pool.push_write(slot.index, frame));
        if let Err(e) = sent {
            warn!("Failed to respond to {} on slot {}: {}", message.id, slot.index, e);
        }
    }

    fn broadcast(&mut self, control: Control) {
        match encode(&Message::unsolicited(Payload::control(control))) {
            Ok(frame) => self.pool.broadcast(&frame),
            Err(e) => warn!("Failed to encode {:?} broadcast: {}", control, e),
        }
    }

    fn reset_prompt(&mut self) {
        debug!("Nested call chain unwound; resetting prompt {}", self.prompt_id);
        let message = Message::new(self.prompt_id, false, Payload::control(Control::ResetPrompt));
        self.push_console_message(&message);
        self.redraw_prompt = true;
    }

    fn push_console(&mut self, id: u32, output: ConsoleOutput) {
        let message = Message::new(id, false, Payload::Console(output));
        self.push_console_message(&message);
    }

    fn push_console_message(&mut self, message: &Message) {
        match encode(message) {
            Ok(frame) => self.pool.push_console(frame),
            Err(e) => warn!("Failed to encode console output: {}", e),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.endpoints.management);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("endpoints", &self.endpoints)
            .field("depth", &self.depth)
            .field("prompt_id", &self.prompt_id)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}
