//! Management channel: out-of-band `break` requests.
//!
//! One client at a time connects to `<name>-M`. A `break` control sets the
//! user-break flag and fires the interpreter's interrupt hook. Anything else
//! is logged. When the client goes away the listener accepts again.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::net::UnixListener;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::interpreter::Interrupt;
use crate::ipc::error::IpcError;
use crate::ipc::framing::{decode, read_frame};
use crate::message::Control;
use crate::worker::pool::bind_listener;

/// User-break flag plus the interpreter's interrupt hook.
#[derive(Default)]
pub struct BreakSignal {
    requested: AtomicBool,
    handler: OnceLock<Box<dyn Interrupt>>,
}

impl BreakSignal {
    pub fn raise(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(handler) = self.handler.get() {
            handler.interrupt();
        }
    }

    /// Consume a pending break request.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Install the interrupt hook. Only the first install takes effect.
    pub fn install(&self, handler: Box<dyn Interrupt>) -> bool {
        self.handler.set(handler).is_ok()
    }
}

impl std::fmt::Debug for BreakSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakSignal")
            .field("requested", &self.requested.load(Ordering::SeqCst))
            .field("handler", &self.handler.get().is_some())
            .finish()
    }
}

/// Bind `path` and serve management clients.
pub(crate) fn spawn(
    runtime: &Handle,
    path: &Path,
    signal: Arc<BreakSignal>,
) -> Result<JoinHandle<()>, IpcError> {
    let listener = bind_listener(runtime, path)?;
    debug!("Management channel listening on {}", path.display());
    Ok(runtime.spawn(serve(listener, signal)))
}

async fn serve(listener: UnixListener, signal: Arc<BreakSignal>) {
    loop {
        let mut stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Management accept failed: {}", e);
                return;
            }
        };

        loop {
            let frame = match read_frame(&mut stream).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Management client reset: {}", e);
                    break;
                }
            };
            match decode(&frame) {
                Ok(message) => match message.control() {
                    Some(Control::Break) => {
                        info!("User break");
                        signal.raise();
                    }
                    _ => warn!("Unexpected management message: {}", message.payload.tag()),
                },
                Err(e) => warn!("Undecodable management frame: {}", e),
            }
        }
    }
}
