//! Worker-side channel pool.
//!
//! The pool owns every channel instance the worker listens on. Slot 0 is the
//! callback channel, slot 1 the primary client, slots 2 and up secondary
//! clients (consoles). All secondaries share the primary's socket; a slot
//! is "listening" while its accept task waits on that socket.
//!
//! Socket I/O runs on tokio tasks that report back through one signal
//! queue. Each slot carries a generation that is bumped on close, so
//! signals from a previous occupant of a slot are dropped.
//!
//! ```text
//! accept task ──► Connected ──► reader loop ──► Frame* ──► Broken
//!                     │
//!                     └──► writer task ──► WriteComplete*
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::ipc::error::IpcError;
use crate::ipc::framing::{read_frame, write_frame};

/// Reserved slot of the callback channel.
pub const CALLBACK_INDEX: usize = 0;
/// Reserved slot of the primary client.
pub const PRIMARY_INDEX: usize = 1;
/// First slot used for secondary clients.
pub const FIRST_SECONDARY_INDEX: usize = 2;

/// Logical role bound to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Callback,
    Primary,
    Secondary,
}

impl Role {
    fn for_index(index: usize) -> Self {
        match index {
            CALLBACK_INDEX => Role::Callback,
            PRIMARY_INDEX => Role::Primary,
            _ => Role::Secondary,
        }
    }
}

/// Connection state of one slot.
///
/// A connected slot always has a read posted by its reader task, so there
/// is no separate reading state: `Connected` means reading with no write
/// queued, `Writing` means at least one frame is queued for the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Listening,
    Connected,
    Writing,
    Broken,
}

/// Slot address qualified by generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    pub index: usize,
    pub generation: u64,
}

/// Pool activity the worker must react to.
#[derive(Debug)]
pub enum PoolEvent {
    Connected(SlotId),
    Frame { slot: SlotId, frame: Vec<u8> },
    Broken { slot: SlotId, reason: String },
}

/// What closing a slot means for the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The primary client is gone; the worker must shut down.
    Fatal,
    /// Callbacks will fail from now on.
    CallbackLost,
    /// A secondary slot was released for reuse.
    Released,
}

/// Messages from I/O tasks to the pool.
enum Signal {
    Connected {
        slot: SlotId,
        writer: UnboundedSender<Vec<u8>>,
    },
    Frame {
        slot: SlotId,
        frame: Vec<u8>,
    },
    WriteComplete(SlotId),
    Broken {
        slot: SlotId,
        reason: String,
    },
}

#[derive(Debug)]
struct Channel {
    path: PathBuf,
    role: Role,
    state: ChannelState,
    generation: u64,
    writer: Option<UnboundedSender<Vec<u8>>>,
    queued: usize,
    task: Option<AbortHandle>,
}

impl Channel {
    fn idle(index: usize) -> Self {
        Self {
            path: PathBuf::new(),
            role: Role::for_index(index),
            state: ChannelState::Idle,
            generation: 0,
            writer: None,
            queued: 0,
            task: None,
        }
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, ChannelState::Connected | ChannelState::Writing)
    }

    fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.writer = None;
        self.queued = 0;
    }
}

/// Growable set of listening/connected channel instances.
pub struct ChannelPool {
    runtime: Handle,
    listeners: HashMap<PathBuf, Arc<UnixListener>>,
    slots: Vec<Channel>,
    signal_tx: Sender<Signal>,
    signals: Receiver<Signal>,
    deferred: VecDeque<PoolEvent>,
    console: Option<usize>,
    /// Console frames produced before any client claimed the console.
    backlog: VecDeque<Vec<u8>>,
}

impl ChannelPool {
    pub fn new(runtime: Handle) -> Self {
        let (signal_tx, signals) = mpsc::channel();
        Self {
            runtime,
            listeners: HashMap::new(),
            slots: Vec::new(),
            signal_tx,
            signals,
            deferred: VecDeque::new(),
            console: None,
            backlog: VecDeque::new(),
        }
    }

    /// Start listening for `role` on `path`.
    ///
    /// The callback and primary roles always land on their reserved slots;
    /// a secondary takes the first idle slot past them. With
    /// `blocking_accept` the call returns only once a peer has connected;
    /// other events seen meanwhile are kept for [`poll`](Self::poll).
    pub fn open(&mut self, path: &Path, role: Role, blocking_accept: bool) -> Result<SlotId, IpcError> {
        let index = match role {
            Role::Callback => CALLBACK_INDEX,
            Role::Primary => PRIMARY_INDEX,
            Role::Secondary => self.free_secondary(),
        };
        while self.slots.len() <= index {
            let next = self.slots.len();
            self.slots.push(Channel::idle(next));
        }

        let listener = self.listener(path)?;
        let channel = &mut self.slots[index];
        channel.disconnect();
        channel.path = path.to_path_buf();
        channel.role = role;
        channel.state = ChannelState::Listening;
        let slot = SlotId {
            index,
            generation: channel.generation,
        };

        let task = self
            .runtime
            .spawn(serve_slot(listener, slot, self.signal_tx.clone()));
        self.slots[index].task = Some(task.abort_handle());
        debug!("Slot {} listening on {} as {:?}", index, path.display(), role);

        if blocking_accept {
            self.await_connect(slot)?;
        }
        Ok(slot)
    }

    fn free_secondary(&self) -> usize {
        self.slots
            .iter()
            .enumerate()
            .skip(FIRST_SECONDARY_INDEX)
            .find(|(_, channel)| channel.state == ChannelState::Idle)
            .map_or(self.slots.len().max(FIRST_SECONDARY_INDEX), |(index, _)| index)
    }

    fn listener(&mut self, path: &Path) -> Result<Arc<UnixListener>, IpcError> {
        if let Some(listener) = self.listeners.get(path) {
            return Ok(Arc::clone(listener));
        }
        let listener = Arc::new(bind_listener(&self.runtime, path)?);
        self.listeners.insert(path.to_path_buf(), Arc::clone(&listener));
        Ok(listener)
    }

    fn await_connect(&mut self, slot: SlotId) -> Result<(), IpcError> {
        let mut held = Vec::new();
        let result = loop {
            match self.poll(None) {
                Some(PoolEvent::Connected(connected)) if connected == slot => break Ok(()),
                Some(PoolEvent::Broken { slot: broken, reason }) if broken == slot => {
                    break Err(IpcError::ChannelBroken(reason))
                }
                Some(other) => held.push(other),
                None => {}
            }
        };
        self.deferred.extend(held);
        result
    }

    /// Next event, waiting at most `timeout` (forever with `None`).
    ///
    /// Write completions and stale signals are absorbed here and never
    /// surface. Returns `None` when the timeout elapses.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Option<PoolEvent> {
        if let Some(event) = self.deferred.pop_front() {
            return Some(event);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let signal = match deadline {
                None => self.signals.recv().ok()?,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.signals.recv_timeout(remaining).ok()?
                }
            };
            if let Some(event) = self.apply(signal) {
                return Some(event);
            }
        }
    }

    fn apply(&mut self, signal: Signal) -> Option<PoolEvent> {
        match signal {
            Signal::Connected { slot, writer } => {
                if self.connect_if_pending(slot, writer) {
                    Some(PoolEvent::Connected(slot))
                } else {
                    None
                }
            }
            Signal::Frame { slot, frame } => self
                .is_current(slot)
                .then_some(PoolEvent::Frame { slot, frame }),
            Signal::WriteComplete(slot) => {
                if self.is_current(slot) {
                    self.write_complete(slot.index);
                }
                None
            }
            Signal::Broken { slot, reason } => {
                if !self.is_current(slot) {
                    return None;
                }
                let channel = &mut self.slots[slot.index];
                channel.state = ChannelState::Broken;
                channel.writer = None;
                channel.queued = 0;
                Some(PoolEvent::Broken { slot, reason })
            }
        }
    }

    /// Transition a listening slot to connected. Connecting a secondary
    /// slot grows the pool so another peer can always attach.
    pub fn connect_if_pending(&mut self, slot: SlotId, writer: UnboundedSender<Vec<u8>>) -> bool {
        if !self.is_current(slot) || self.slots[slot.index].state != ChannelState::Listening {
            return false;
        }

        let channel = &mut self.slots[slot.index];
        channel.state = ChannelState::Connected;
        channel.writer = Some(writer);
        channel.queued = 0;
        info!("Client connected on slot {} ({:?})", slot.index, channel.role);

        if slot.index >= FIRST_SECONDARY_INDEX {
            if let Err(e) = self.grow() {
                warn!("Failed to open a replacement listener: {}", e);
            }
        }
        true
    }

    /// Add a listening secondary slot on the primary socket.
    pub fn grow(&mut self) -> Result<SlotId, IpcError> {
        let path = self
            .slots
            .get(PRIMARY_INDEX)
            .map(|channel| channel.path.clone())
            .filter(|path| !path.as_os_str().is_empty())
            .ok_or(IpcError::NotConnected)?;
        self.open(&path, Role::Secondary, false)
    }

    /// Close slot `index`.
    ///
    /// Secondary slots go back to idle for reuse. The reserved slots stay
    /// broken; what that means is reported in the outcome.
    pub fn close(&mut self, index: usize) -> CloseOutcome {
        if self.console == Some(index) {
            info!("Console client on slot {} detached", index);
            self.console = None;
        }

        let Some(channel) = self.slots.get_mut(index) else {
            warn!("Close of unknown slot {}", index);
            return CloseOutcome::Released;
        };
        channel.disconnect();
        channel.generation += 1;

        match index {
            PRIMARY_INDEX => {
                channel.state = ChannelState::Broken;
                CloseOutcome::Fatal
            }
            CALLBACK_INDEX => {
                channel.state = ChannelState::Broken;
                CloseOutcome::CallbackLost
            }
            _ => {
                channel.state = ChannelState::Idle;
                if !self.secondary_listening() {
                    if let Err(e) = self.grow() {
                        warn!("Failed to reopen a secondary listener: {}", e);
                    }
                }
                CloseOutcome::Released
            }
        }
    }

    fn secondary_listening(&self) -> bool {
        self.slots
            .iter()
            .skip(FIRST_SECONDARY_INDEX)
            .any(|channel| channel.state == ChannelState::Listening)
    }

    /// Queue a frame for the peer on slot `index`.
    pub fn push_write(&mut self, index: usize, frame: Vec<u8>) -> Result<(), IpcError> {
        let channel = self.slots.get_mut(index).ok_or(IpcError::NotConnected)?;
        let writer = channel.writer.as_ref().ok_or(IpcError::NotConnected)?;
        writer
            .send(frame)
            .map_err(|_| IpcError::ChannelBroken(format!("writer for slot {} stopped", index)))?;
        channel.queued += 1;
        channel.state = ChannelState::Writing;
        Ok(())
    }

    pub fn write_complete(&mut self, index: usize) {
        if let Some(channel) = self.slots.get_mut(index) {
            channel.queued = channel.queued.saturating_sub(1);
            if channel.queued == 0 && channel.state == ChannelState::Writing {
                channel.state = ChannelState::Connected;
            }
        }
    }

    /// Write to every connected client slot (not the callback channel).
    pub fn broadcast(&mut self, frame: &[u8]) {
        let targets: Vec<usize> = (PRIMARY_INDEX..self.slots.len())
            .filter(|&index| self.slots[index].is_connected())
            .collect();
        for index in targets {
            if let Err(e) = self.push_write(index, frame.to_vec()) {
                debug!("Broadcast to slot {} failed: {}", index, e);
            }
        }
    }

    /// Make slot `index` the console and flush buffered output to it in
    /// order.
    ///
    /// The first claim wins: while another connected slot holds the
    /// console, the claim is ignored and `Ok(false)` is returned.
    pub fn designate_console(&mut self, index: usize) -> Result<bool, IpcError> {
        if !self.is_connected(index) {
            return Err(IpcError::NotConnected);
        }
        if let Some(holder) = self.console.filter(|&holder| holder != index) {
            if self.is_connected(holder) {
                return Ok(false);
            }
        }
        self.console = Some(index);
        while let Some(frame) = self.backlog.pop_front() {
            if let Err(e) = self.push_write(index, frame.clone()) {
                self.backlog.push_front(frame);
                self.console = None;
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Send a frame to the console, or buffer it until one attaches.
    pub fn push_console(&mut self, frame: Vec<u8>) {
        if let Some(index) = self.console {
            match self.push_write(index, frame.clone()) {
                Ok(()) => return,
                Err(e) => {
                    warn!("Console on slot {} unavailable: {}", index, e);
                    self.console = None;
                }
            }
        }
        self.backlog.push_back(frame);
    }

    /// Wait until every queued write has completed.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn flush(&mut self, timeout: Duration) -> bool {
        self.pump_until(Instant::now() + timeout, |pool| {
            pool.slots.iter().all(|channel| channel.queued == 0)
        })
    }

    /// Wait up to `timeout` for a listening slot whose peer may already be
    /// connecting. Returns whether the slot is connected.
    pub fn wait_connected(&mut self, index: usize, timeout: Duration) -> bool {
        self.pump_until(Instant::now() + timeout, |pool| {
            pool.state(index) != Some(ChannelState::Listening)
        });
        self.is_connected(index)
    }

    /// Apply signals until `done` holds or `deadline` passes. Events seen
    /// meanwhile are kept for [`poll`](Self::poll).
    fn pump_until(&mut self, deadline: Instant, done: impl Fn(&Self) -> bool) -> bool {
        while !done(self) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.signals.recv_timeout(remaining) {
                Ok(signal) => {
                    if let Some(event) = self.apply(signal) {
                        self.deferred.push_back(event);
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    pub fn is_current(&self, slot: SlotId) -> bool {
        self.slots
            .get(slot.index)
            .is_some_and(|channel| channel.generation == slot.generation)
    }

    pub fn is_connected(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Channel::is_connected)
    }

    pub fn state(&self, index: usize) -> Option<ChannelState> {
        self.slots.get(index).map(|channel| channel.state)
    }

    pub fn role(&self, index: usize) -> Option<Role> {
        self.slots.get(index).map(|channel| channel.role)
    }

    pub fn console(&self) -> Option<usize> {
        self.console
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of slots waiting for a peer.
    pub fn listening(&self) -> usize {
        self.slots
            .iter()
            .filter(|channel| channel.state == ChannelState::Listening)
            .count()
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        for channel in &mut self.slots {
            channel.disconnect();
        }
        for path in self.listeners.keys() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Bind a Unix listener, replacing a stale socket file.
pub(crate) fn bind_listener(runtime: &Handle, path: &Path) -> Result<UnixListener, IpcError> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(IpcError::Io(e)),
    }
    let _guard = runtime.enter();
    UnixListener::bind(path).map_err(IpcError::Io)
}

async fn serve_slot(listener: Arc<UnixListener>, slot: SlotId, signals: Sender<Signal>) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = signals.send(Signal::Broken {
                slot,
                reason: format!("accept failed: {}", e),
            });
            return;
        }
    };

    let (mut reader, writer) = stream.into_split();
    let (writer_tx, frames) = unbounded_channel();
    tokio::spawn(write_loop(writer, frames, slot, signals.clone()));
    if signals
        .send(Signal::Connected {
            slot,
            writer: writer_tx,
        })
        .is_err()
    {
        return;
    }

    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if signals.send(Signal::Frame { slot, frame }).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = signals.send(Signal::Broken {
                    slot,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut frames: UnboundedReceiver<Vec<u8>>,
    slot: SlotId,
    signals: Sender<Signal>,
) {
    while let Some(frame) = frames.recv().await {
        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                let _ = signals.send(Signal::WriteComplete(slot));
            }
            Err(e) => {
                let _ = signals.send(Signal::Broken {
                    slot,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}
