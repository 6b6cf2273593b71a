//! Call/response engine for the front end.
//!
//! `CallEngine` owns the primary connection to the worker. Socket I/O runs
//! as tokio tasks; the engine itself is driven synchronously from the host
//! thread so that callbacks and nested calls run on that same thread.
//!
//! While a blocking call waits, the inbound queue carries two kinds of
//! readiness: frames from the primary channel and callbacks routed by the
//! [`CallbackGate`]. Callbacks are serviced inline and the wait continues;
//! only the matching response ends it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ipc::callback::{spawn_listener, CallbackGate, CallbackRequest, HostCallbacks};
use crate::ipc::error::{IpcError, FRAME_ERROR_DIAGNOSTIC};
use crate::ipc::framing::{decode, encode, read_frame, write_frame, write_message};
use crate::ipc::registry::TransactionRegistry;
use crate::ipc::Endpoints;
use crate::message::{Control, Message, Payload, UNSOLICITED_ID};

/// Connection retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(100),
        }
    }
}

/// Readiness delivered to a waiting caller.
#[derive(Debug)]
pub enum Inbound {
    /// Raw frame from the primary channel.
    Frame(Vec<u8>),
    /// Callback routed here by the gate.
    Callback(CallbackRequest),
    /// The primary channel is gone.
    Broken(String),
}

/// Synchronous call/response engine with inline callback servicing.
///
/// # Example
///
/// ```ignore
/// let engine = CallEngine::connect(runtime.handle(), &endpoints, host, Retry::default())?;
/// let reply = engine.call(Payload::Code(block), true);
/// ```
pub struct CallEngine {
    outbound: UnboundedSender<Vec<u8>>,
    inbound: Receiver<Inbound>,
    /// Responses that arrived while a different id was awaited.
    stash: RefCell<HashMap<u32, Message>>,
    registry: TransactionRegistry,
    gate: Arc<CallbackGate>,
    host: Arc<dyn HostCallbacks>,
    broken: RefCell<Option<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl CallEngine {
    /// Connect the primary and callback channels of a running worker.
    ///
    /// Must be called from outside the runtime's worker threads.
    ///
    /// # Errors
    ///
    /// Returns the last connection error if the worker never accepts.
    pub fn connect(
        runtime: &Handle,
        endpoints: &Endpoints,
        host: Arc<dyn HostCallbacks>,
        retry: Retry,
    ) -> Result<Self, IpcError> {
        let (primary, callback) = runtime.block_on(async {
            let primary = connect_with_retry(&endpoints.primary, retry).await?;
            let callback = connect_with_retry(&endpoints.callback, retry).await?;
            Ok::<_, IpcError>((primary, callback))
        })?;
        info!("Connected to worker at {}", endpoints.primary.display());

        let (inbound_tx, inbound) = mpsc::channel();
        let (outbound, outbound_rx) = unbounded_channel();
        let gate = Arc::new(CallbackGate::new(inbound_tx.clone()));

        let (mut reader, writer) = primary.into_split();
        let reader_task = runtime.spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => {
                        if inbound_tx.send(Inbound::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        info!("Primary channel closed: {}", e);
                        let _ = inbound_tx.send(Inbound::Broken(e.to_string()));
                        break;
                    }
                }
            }
        });
        // Not aborted on drop: queued fire-and-forget frames still go out.
        runtime.spawn(write_loop(writer, outbound_rx));
        let listener = spawn_listener(runtime, callback, Arc::clone(&gate), Arc::clone(&host));

        Ok(Self {
            outbound,
            inbound,
            stash: RefCell::new(HashMap::new()),
            registry: TransactionRegistry::new(),
            gate,
            host,
            broken: RefCell::new(None),
            tasks: vec![reader_task, listener],
        })
    }

    /// Send `payload` as a new transaction.
    ///
    /// Returns `None` for a fire-and-forget call that was posted. A blocking
    /// call returns the correlated response; transport failures come back
    /// as error-tagged messages, never as a hang.
    pub fn call(&self, payload: Payload, block: bool) -> Option<Message> {
        if block {
            return Some(self.request(payload));
        }

        let message = Message::new(self.registry.next_id(), false, payload);
        match self.post(&message) {
            Ok(()) => None,
            Err(e) => Some(Message::error(message.id, e.to_string())),
        }
    }

    /// Blocking call. Callbacks arriving meanwhile run on this thread.
    pub fn request(&self, payload: Payload) -> Message {
        let id = self.registry.next_id();
        let message = Message::new(id, true, payload);

        let response = {
            let _blocked = self.gate.enter();
            match self.post(&message) {
                Ok(()) => self.wait_for(id),
                Err(e) => Message::error(id, e.to_string()),
            }
        };
        if self.gate.is_idle() {
            self.drain();
        }
        response
    }

    pub fn is_broken(&self) -> bool {
        self.broken.borrow().is_some()
    }

    /// True while a blocking call is waiting on this engine.
    pub fn in_call(&self) -> bool {
        !self.gate.is_idle()
    }

    fn post(&self, message: &Message) -> Result<(), IpcError> {
        if let Some(reason) = self.broken.borrow().as_ref() {
            return Err(IpcError::ChannelBroken(reason.clone()));
        }
        let frame = encode(message)?;
        self.outbound
            .send(frame)
            .map_err(|_| IpcError::ChannelBroken("writer stopped".into()))
    }

    fn wait_for(&self, id: u32) -> Message {
        loop {
            if let Some(message) = self.stash.borrow_mut().remove(&id) {
                return message;
            }
            if let Some(reason) = self.broken.borrow().as_ref() {
                return Message::error(id, reason.clone());
            }

            match self.inbound.recv() {
                Ok(Inbound::Frame(frame)) => match decode(&frame) {
                    Ok(message) if message.id == id => return message,
                    Ok(message) => self.absorb(message),
                    Err(e) => {
                        warn!("Undecodable response while waiting for {}: {}", id, e);
                        return Message::error(id, FRAME_ERROR_DIAGNOSTIC);
                    }
                },
                Ok(Inbound::Callback(request)) => request.complete(self.host.as_ref(), self),
                Ok(Inbound::Broken(reason)) => self.mark_broken(reason),
                Err(_) => self.mark_broken("inbound queue closed".into()),
            }
        }
    }

    /// Handle whatever arrived after the outermost call returned.
    fn drain(&self) {
        while let Ok(inbound) = self.inbound.try_recv() {
            match inbound {
                Inbound::Frame(frame) => match decode(&frame) {
                    Ok(message) => self.absorb(message),
                    Err(e) => warn!("Dropping undecodable frame: {}", e),
                },
                Inbound::Callback(request) => request.complete(self.host.as_ref(), self),
                Inbound::Broken(reason) => self.mark_broken(reason),
            }
        }
    }

    fn absorb(&self, message: Message) {
        if message.control() == Some(Control::Shutdown) {
            self.mark_broken("worker shut down".into());
        } else if message.id == UNSOLICITED_ID {
            debug!("Ignoring unsolicited {} message", message.payload.tag());
        } else {
            self.stash.borrow_mut().insert(message.id, message);
        }
    }

    fn mark_broken(&self, reason: String) {
        warn!("Worker connection broken: {}", reason);
        self.broken.borrow_mut().get_or_insert(reason);
    }
}

impl Drop for CallEngine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            warn!("Primary channel write failed: {}", e);
            break;
        }
    }
}

/// Connect with a fixed retry schedule.
///
/// Useful at startup while the worker is still binding its sockets.
pub async fn connect_with_retry(socket_path: &Path, retry: Retry) -> Result<UnixStream, IpcError> {
    let mut last_error = None;

    for attempt in 1..=retry.attempts.max(1) {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(
                    "Connection attempt {}/{} to {} failed: {}",
                    attempt,
                    retry.attempts,
                    socket_path.display(),
                    e
                );
                last_error = Some(e);
                if attempt < retry.attempts {
                    tokio::time::sleep(retry.delay).await;
                }
            }
        }
    }

    Err(last_error.map_or(IpcError::NotConnected, IpcError::ConnectionFailed))
}

/// Ask a worker to interrupt its interpreter via the management channel.
pub async fn request_break(management: &Path) -> Result<(), IpcError> {
    let mut stream = UnixStream::connect(management)
        .await
        .map_err(IpcError::ConnectionFailed)?;
    write_message(&mut stream, &Message::unsolicited(Payload::control(Control::Break))).await?;
    info!("Sent break to {}", management.display());
    Ok(())
}
