//! Front-end side of the callback channel.
//!
//! The worker calls back into the host on the dedicated `-CB` channel. A
//! listener task reads those calls and asks the [`CallbackGate`] where each
//! one must run:
//!
//! ```text
//!  -CB socket ──► listener task ──► gate.route()
//!                                     │
//!               ┌─────────────────────┴──────────────────────┐
//!        blocking call in progress                     front end idle
//!               │                                            │
//!   Inbound::Callback into the caller's          spawn_blocking(on_detached_callback)
//!   wait loop, answer on a oneshot
//! ```
//!
//! Routing and leaving a blocking call both happen under the gate lock, so a
//! callback is either queued to a wait loop that will see it or run
//! detached. It is never stranded.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::UnixStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ipc::client::{CallEngine, Inbound};
use crate::ipc::error::FRAME_ERROR_DIAGNOSTIC;
use crate::ipc::framing::{decode, read_frame, recover_envelope, write_message};
use crate::message::{Message, Payload};

/// Host application entry points for worker callbacks.
pub trait HostCallbacks: Send + Sync + 'static {
    /// Run a callback on the thread that is blocked in
    /// [`CallEngine::call`]. The engine may be used for nested calls.
    fn on_callback(&self, engine: &CallEngine, call: &Message) -> Payload;

    /// Run a callback that arrived while no blocking call was in progress.
    fn on_detached_callback(&self, call: &Message) -> Payload {
        Payload::Error(format!(
            "no handler for standalone callback {}",
            call.payload.tag()
        ))
    }
}

/// A callback handed to a blocked caller.
pub struct CallbackRequest {
    pub message: Message,
    reply: oneshot::Sender<Payload>,
}

impl CallbackRequest {
    /// Run the host handler and send its result back to the listener.
    pub(crate) fn complete(self, host: &dyn HostCallbacks, engine: &CallEngine) {
        let payload = catch_unwind(AssertUnwindSafe(|| host.on_callback(engine, &self.message)))
            .unwrap_or_else(|panic| Payload::Error(panic_message(panic.as_ref())));
        if self.reply.send(payload).is_err() {
            debug!("Callback {} answered after listener went away", self.message.id);
        }
    }
}

impl std::fmt::Debug for CallbackRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRequest")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Blocked { depth: u32 },
}

/// Where an inbound callback must run.
#[derive(Debug)]
pub enum Route {
    /// Queued to the blocked caller; the answer arrives on the receiver.
    Inline(oneshot::Receiver<Payload>),
    /// Nobody is blocked; run it standalone.
    Detached(Message),
}

/// Requested/completed rendezvous between the callback listener and the
/// thread blocked in a call.
#[derive(Debug)]
pub struct CallbackGate {
    state: Mutex<GateState>,
    inbound: Sender<Inbound>,
}

impl CallbackGate {
    pub(crate) fn new(inbound: Sender<Inbound>) -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            inbound,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a blocking call in progress until the guard drops.
    pub fn enter(&self) -> GateGuard<'_> {
        let mut state = self.lock();
        *state = match *state {
            GateState::Idle => GateState::Blocked { depth: 1 },
            GateState::Blocked { depth } => GateState::Blocked { depth: depth + 1 },
        };
        GateGuard { gate: self }
    }

    fn leave(&self) {
        let mut state = self.lock();
        *state = match *state {
            GateState::Blocked { depth } if depth > 1 => GateState::Blocked { depth: depth - 1 },
            _ => GateState::Idle,
        };
    }

    pub fn is_idle(&self) -> bool {
        *self.lock() == GateState::Idle
    }

    /// Decide where `call` runs. Inline routes are queued before the lock
    /// is released.
    pub fn route(&self, call: Message) -> Route {
        let state = self.lock();
        if *state == GateState::Idle {
            return Route::Detached(call);
        }

        let (reply, answer) = oneshot::channel();
        // A closed inbound drops `reply`, so the listener sees an error.
        let _ = self.inbound.send(Inbound::Callback(CallbackRequest {
            message: call,
            reply,
        }));
        drop(state);
        Route::Inline(answer)
    }
}

/// Keeps the gate blocked for the duration of one call.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a CallbackGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

/// Serve the callback channel until the worker closes it.
pub(crate) fn spawn_listener(
    runtime: &Handle,
    stream: UnixStream,
    gate: Arc<CallbackGate>,
    host: Arc<dyn HostCallbacks>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let (mut reader, mut writer) = stream.into_split();
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(frame) => frame,
                Err(e) => {
                    info!("Callback channel closed: {}", e);
                    break;
                }
            };

            let reply = match decode(&frame) {
                Ok(call) => {
                    let (id, wait) = (call.id, call.wait);
                    let payload = dispatch(call, &gate, &host).await;
                    if !wait {
                        continue;
                    }
                    Message::response(id, payload)
                }
                Err(e) => {
                    warn!("Undecodable callback frame: {}", e);
                    let envelope = recover_envelope(&frame);
                    if envelope.is_some_and(|env| !env.wait) {
                        continue;
                    }
                    Message::error(envelope.map_or(0, |env| env.id), FRAME_ERROR_DIAGNOSTIC)
                }
            };

            if let Err(e) = write_message(&mut writer, &reply).await {
                warn!("Failed to answer callback {}: {}", reply.id, e);
                break;
            }
        }
    })
}

async fn dispatch(call: Message, gate: &CallbackGate, host: &Arc<dyn HostCallbacks>) -> Payload {
    match gate.route(call) {
        Route::Inline(answer) => answer
            .await
            .unwrap_or_else(|_| Payload::Error("front end dropped the callback".into())),
        Route::Detached(call) => {
            let host = Arc::clone(host);
            tokio::task::spawn_blocking(move || host.on_detached_callback(&call))
                .await
                .unwrap_or_else(|e| Payload::Error(format!("callback failed: {}", e)))
        }
    }
}

/// Extract a readable message from a caught panic.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CallbackInvocation;
    use std::sync::mpsc;

    fn invocation(id: u32) -> Message {
        Message::new(
            id,
            true,
            Payload::Callback(CallbackInvocation {
                target: "echo".into(),
                arguments: vec![],
            }),
        )
    }

    #[test]
    fn test_idle_gate_routes_detached() {
        let (tx, rx) = mpsc::channel();
        let gate = CallbackGate::new(tx);

        assert!(gate.is_idle());
        assert!(matches!(gate.route(invocation(1)), Route::Detached(m) if m.id == 1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_blocked_gate_queues_inline() {
        let (tx, rx) = mpsc::channel();
        let gate = CallbackGate::new(tx);

        let guard = gate.enter();
        let route = gate.route(invocation(2));
        assert!(matches!(route, Route::Inline(_)));
        match rx.try_recv() {
            Ok(Inbound::Callback(request)) => assert_eq!(request.message.id, 2),
            other => panic!("expected queued callback, got {:?}", other),
        }
        drop(guard);
        assert!(gate.is_idle());
    }

    #[test]
    fn test_nested_guards_keep_gate_blocked() {
        let (tx, _rx) = mpsc::channel();
        let gate = CallbackGate::new(tx);

        let outer = gate.enter();
        let inner = gate.enter();
        drop(inner);
        assert!(!gate.is_idle());
        drop(outer);
        assert!(gate.is_idle());
    }

    #[tokio::test]
    async fn test_closed_inbound_fails_inline_answer() {
        let (tx, rx) = mpsc::channel();
        let gate = CallbackGate::new(tx);
        drop(rx);

        let _guard = gate.enter();
        match gate.route(invocation(3)) {
            Route::Inline(answer) => assert!(answer.await.is_err()),
            Route::Detached(_) => panic!("blocked gate must route inline"),
        }
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom");
    }
}
