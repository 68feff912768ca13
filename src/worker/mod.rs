//! Transport workers: one thread per device connection.
//!
//! A worker owns one [`Transport`] and drives it through
//! `Stopped → Connecting → Connected → (error → Connecting) → Stopping → Stopped`.
//!
//! - Recoverable errors (I/O, refused, closed) log a warning and reconnect
//!   after the retry interval. Any partially correlated state is discarded.
//! - Fatal errors log at error level and end the worker.
//!
//! Submodules:
//! - [`tcp`]: line protocol with ack/nack replies and status pushes
//! - [`telnet`]: line protocol with echo correlation
//! - [`osc`]: OSC messages over UDP

pub mod osc;
pub mod tcp;
pub mod telnet;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, TransportError};
use crate::item::{AnswerValues, ComType, CommandAnswerItem, CommandSendItem};
use crate::signal::StopSignal;
use crate::template::TemplateSet;
use crate::value::Value;

pub use osc::{OscProfile, OscTransport};
pub use tcp::{LineProfile, TcpTransport};
pub use telnet::{TelnetProfile, TelnetTransport};

/// Default delay before reconnecting after a recoverable error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Connecting,
    Connected,
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Connecting => "connecting",
            WorkerState::Connected => "connected",
            WorkerState::Stopping => "stopping",
        })
    }
}

// ---------------------------------------------------------------------------
// Answer sink
// ---------------------------------------------------------------------------

/// Handle to the shared answer queue, stamped with the worker's device name.
#[derive(Debug, Clone)]
pub struct AnswerSink {
    device: String,
    tx: Sender<CommandAnswerItem>,
}

impl AnswerSink {
    pub fn new(device: impl Into<String>, tx: Sender<CommandAnswerItem>) -> Self {
        Self { device: device.into(), tx }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn send(&self, answer: CommandAnswerItem) -> Result<(), TransportError> {
        info!(device = %self.device, "<~~ {answer}");
        self.tx.send(answer).map_err(|_| TransportError::AnswerChannelClosed)
    }

    pub fn emit(
        &self,
        command: Option<&str>,
        values: AnswerValues,
        message_type: ComType,
    ) -> Result<(), TransportError> {
        self.send(CommandAnswerItem::new(
            self.device.clone(),
            command.map(str::to_string),
            values,
            message_type,
        ))
    }

    /// Report a reply nobody could resolve, keeping the raw payload.
    pub fn unidentifiable(&self, raw: Vec<Value>) -> Result<(), TransportError> {
        self.emit(None, AnswerValues::Raw(raw), ComType::Unidentifiable)
    }

    /// Report an item that could not be put on the wire.
    pub fn failed(
        &self,
        item: &CommandSendItem,
        reason: &dyn fmt::Display,
    ) -> Result<(), TransportError> {
        warn!(device = %self.device, "cannot send {item}: {reason}");
        self.emit(Some(&item.command), AnswerValues::empty(), ComType::Failed)
    }
}

// ---------------------------------------------------------------------------
// Context and transport trait
// ---------------------------------------------------------------------------

/// Everything a transport needs from its worker.
#[derive(Debug)]
pub struct WorkerContext {
    pub device: String,
    pub templates: Arc<TemplateSet>,
    /// Items routed to this device.
    pub inbox: Receiver<CommandSendItem>,
    /// Sender side of `inbox`, for items the worker schedules itself.
    pub requeue: Sender<CommandSendItem>,
    pub answers: AnswerSink,
    pub stop: StopSignal,
}

impl WorkerContext {
    /// Build a context with a fresh inbox.
    pub fn new(
        device: impl Into<String>,
        templates: Arc<TemplateSet>,
        answers: Sender<CommandAnswerItem>,
        stop: StopSignal,
    ) -> Self {
        let device = device.into();
        let (requeue, inbox) = mpsc::channel();
        Self {
            answers: AnswerSink::new(device.clone(), answers),
            device,
            templates,
            inbox,
            requeue,
            stop,
        }
    }

    /// Next queued item, without blocking.
    pub fn try_next(&self) -> Option<CommandSendItem> {
        self.inbox.try_recv().ok()
    }

    /// Next queued item, waiting up to `timeout`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<CommandSendItem> {
        match self.inbox.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// One device protocol.
///
/// `poll` is one iteration of the main loop and must return within a short,
/// bounded time so the stop signal is observed promptly.
pub trait Transport: Send {
    /// Open the connection and perform any login.
    fn connect(&mut self, ctx: &WorkerContext) -> Result<(), TransportError>;

    /// Send at most one queued item and handle whatever arrived.
    fn poll(&mut self, ctx: &WorkerContext) -> Result<(), TransportError>;

    /// Drop the connection and all correlation state.
    fn disconnect(&mut self);

    /// Called once when the worker ends.
    fn on_exit(&mut self) {}
}

/// Drive `transport` until the stop signal is raised or a fatal error occurs.
pub fn run(
    transport: &mut dyn Transport,
    ctx: &WorkerContext,
    retry_interval: Duration,
) -> Result<(), TransportError> {
    let device = ctx.device.as_str();
    let outcome = loop {
        if ctx.stop.is_set() {
            break Ok(());
        }
        debug!(device, state = %WorkerState::Connecting, "connecting");
        let session = transport.connect(ctx).and_then(|()| {
            info!(device, state = %WorkerState::Connected, "connected");
            while !ctx.stop.is_set() {
                transport.poll(ctx)?;
            }
            Ok(())
        });
        transport.disconnect();

        match session {
            Ok(()) => break Ok(()),
            Err(e) if e.kind() == ErrorKind::Recoverable => {
                warn!(
                    device,
                    os_error = e.os_code(),
                    "connection error: {e}; retrying in {:.1}s",
                    retry_interval.as_secs_f64()
                );
                if ctx.stop.wait_timeout(retry_interval) {
                    break Ok(());
                }
            }
            Err(e) => {
                error!(device, "worker failed: {e}");
                break Err(e);
            }
        }
    };
    debug!(device, state = %WorkerState::Stopping, "stopping");
    transport.on_exit();
    info!(device, state = %WorkerState::Stopped, "stopped");
    outcome
}

// ---------------------------------------------------------------------------
// Worker threads
// ---------------------------------------------------------------------------

/// A running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    device: String,
    sender: Sender<CommandSendItem>,
    stop: StopSignal,
    join: JoinHandle<Result<(), TransportError>>,
}

impl WorkerHandle {
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Sender into the worker's inbox.
    pub fn sender(&self) -> Sender<CommandSendItem> {
        self.sender.clone()
    }

    /// Ask the worker to stop. Returns immediately.
    pub fn signal_stop(&self) {
        self.stop.set();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker thread. `Err` carries the fatal error, if any.
    pub fn join(self) -> Result<(), TransportError> {
        self.join
            .join()
            .unwrap_or_else(|_| Err(TransportError::Fault("worker thread panicked".into())))
    }
}

/// Start `transport` on its own thread.
pub fn spawn(
    device: impl Into<String>,
    templates: Arc<TemplateSet>,
    mut transport: Box<dyn Transport>,
    answers: Sender<CommandAnswerItem>,
    retry_interval: Duration,
) -> io::Result<WorkerHandle> {
    let stop = StopSignal::new();
    let ctx = WorkerContext::new(device, templates, answers, stop.clone());
    let device = ctx.device.clone();
    let sender = ctx.requeue.clone();
    let join = thread::Builder::new()
        .name(format!("worker {device}"))
        .spawn(move || run(transport.as_mut(), &ctx, retry_interval))?;
    info!(device = %device, "worker started");
    Ok(WorkerHandle { device, sender, stop, join })
}
