//! Test doubles shared by the transport and dispatcher tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::conn::{Connector, Endpoint, Link};
use crate::error::TransportError;
use crate::item::CommandAnswerItem;
use crate::signal::StopSignal;
use crate::template::TemplateSet;
use crate::worker::WorkerContext;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Script {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
    closed: bool,
    refuse: usize,
    connects: usize,
}

/// In-memory device. Clones share state, so a test keeps one handle while the
/// transport owns the [`Link`]s it opens.
#[derive(Clone, Default)]
pub struct ScriptedDevice {
    script: Arc<Mutex<Script>>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every write with the chunks `f` returns.
    pub fn respond_with(self, f: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) -> Self {
        self.script.lock().responder = Some(Box::new(f));
        self
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse(self, n: usize) -> Self {
        self.script.lock().refuse = n;
        self
    }

    /// Queue unsolicited inbound bytes.
    pub fn push(&self, data: &[u8]) {
        self.script.lock().inbound.push_back(data.to_vec());
    }

    /// Make the next empty read report a closed connection.
    pub fn close(&self) {
        self.script.lock().closed = true;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.script.lock().written.clone()
    }

    pub fn written_text(&self) -> Vec<String> {
        self.written().iter().map(|w| String::from_utf8_lossy(w).into_owned()).collect()
    }

    pub fn connects(&self) -> usize {
        self.script.lock().connects
    }
}

impl Connector for ScriptedDevice {
    fn connect(&self, _endpoint: &Endpoint) -> Result<Box<dyn Link>, TransportError> {
        let mut s = self.script.lock();
        s.connects += 1;
        if s.refuse > 0 {
            s.refuse -= 1;
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
        }
        s.closed = false;
        Ok(Box::new(self.clone()))
    }
}

impl Link for ScriptedDevice {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut s = self.script.lock();
        s.written.push(data.to_vec());
        if let Some(mut f) = s.responder.take() {
            let chunks = f(data);
            s.inbound.extend(chunks);
            s.responder = Some(f);
        }
        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let mut s = self.script.lock();
        if let Some(chunk) = s.inbound.pop_front() {
            return Ok(Some(chunk));
        }
        if s.closed {
            return Err(TransportError::Disconnected);
        }
        drop(s);
        thread::sleep(timeout.min(Duration::from_millis(2)));
        Ok(None)
    }

    fn shutdown(&mut self) {}
}

/// A worker context plus the answer queue it feeds.
pub fn context(device: &str, templates: TemplateSet) -> (WorkerContext, Receiver<CommandAnswerItem>) {
    let (tx, rx) = mpsc::channel();
    let ctx = WorkerContext::new(device, Arc::new(templates), tx, StopSignal::new());
    (ctx, rx)
}

/// Every answer currently queued.
pub fn drain(rx: &Receiver<CommandAnswerItem>) -> Vec<CommandAnswerItem> {
    rx.try_iter().collect()
}

/// Counts events at or above WARN.
#[derive(Clone, Default)]
pub struct WarnCounter {
    count: Arc<AtomicUsize>,
}

impl WarnCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
