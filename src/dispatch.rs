//! Routing of submissions to device workers.
//!
//! The [`Dispatcher`] starts one worker per configured device and keeps a
//! table from device name to that worker's inbox. Registry devices without
//! a configured endpoint are routed to a sink that only logs. Items with a
//! delay wait on a [`PausableTimer`]; the `pause` and `resume` control tokens
//! act on all of those timers at once.

use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::{debug, error, info, warn};

use crate::conn::Endpoint;
use crate::devices::Registry;
use crate::item::{CommandAnswerItem, CommandSendItem, ControlToken, Submission};
use crate::signal::StopSignal;
use crate::timer::PausableTimer;
use crate::worker::{self, DEFAULT_RETRY_INTERVAL, WorkerHandle};

/// How often `run` checks the stop signal while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Startup parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Device name → endpoint. Only these devices get a worker.
    pub devices: IndexMap<String, Endpoint>,
    pub retry_interval: Duration,
    /// How long `stop` waits for workers before detaching them.
    pub join_grace: Duration,
    pub template_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            devices: IndexMap::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            join_grace: Duration::from_secs(5),
            template_dir: None,
        }
    }
}

impl DispatchConfig {
    pub fn with_device(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.devices.insert(name.into(), endpoint);
        self
    }
}

#[derive(Debug)]
enum Route {
    Worker(Sender<CommandSendItem>),
    Sink,
}

/// What `submit` did with a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Routed,
    Delayed,
    Control(ControlToken),
    Dropped,
}

pub struct Dispatcher {
    routes: IndexMap<String, Route>,
    workers: Vec<WorkerHandle>,
    timers: Vec<PausableTimer>,
    join_grace: Duration,
}

impl Dispatcher {
    /// Start a worker for every configured device. Devices that fail to
    /// start are routed to the sink.
    pub fn start(
        registry: &Registry,
        config: &DispatchConfig,
        answers: Sender<CommandAnswerItem>,
    ) -> Self {
        let mut routes = IndexMap::new();
        let mut workers = Vec::new();

        for (name, endpoint) in &config.devices {
            let Some(spec) = registry.get(name) else {
                warn!(device = %name, "device not supported, ignoring its configuration");
                continue;
            };
            let started = spec
                .templates(config.template_dir.as_deref())
                .map_err(|e| e.to_string())
                .and_then(|templates| {
                    let transport = spec.transport(endpoint).map_err(|e| e.to_string())?;
                    worker::spawn(name.clone(), templates, transport, answers.clone(), config.retry_interval)
                        .map_err(|e| e.to_string())
                });
            match started {
                Ok(handle) => {
                    info!(device = %name, %endpoint, kind = %spec.kind, "device started");
                    routes.insert(name.clone(), Route::Worker(handle.sender()));
                    workers.push(handle);
                }
                Err(e) => {
                    error!(device = %name, "cannot start device: {e}");
                    routes.insert(name.clone(), Route::Sink);
                }
            }
        }
        for name in registry.names() {
            if !routes.contains_key(name) {
                debug!(device = %name, "not configured, routed to sink");
                routes.insert(name.to_string(), Route::Sink);
            }
        }

        Self { routes, workers, timers: Vec::new(), join_grace: config.join_grace }
    }

    /// Names of the devices with a running worker.
    pub fn started(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(WorkerHandle::device)
    }

    /// Delayed sends that have not fired or been cancelled.
    pub fn pending_delays(&self) -> usize {
        self.timers.iter().filter(|t| !t.is_finished()).count()
    }

    /// Route an item or apply a control token. Never fails; anything that
    /// cannot be delivered is logged and dropped.
    pub fn submit(&mut self, submission: impl Into<Submission>) -> Submitted {
        self.timers.retain(|t| !t.is_finished());
        match submission.into() {
            Submission::Control(token) => {
                self.control(token);
                Submitted::Control(token)
            }
            Submission::Send(item) => self.route(item),
        }
    }

    fn route(&mut self, item: CommandSendItem) -> Submitted {
        let tx = match self.routes.get(&item.device) {
            Some(Route::Worker(tx)) => tx.clone(),
            Some(Route::Sink) => {
                warn!(device = %item.device, "~~X device not started, {item} was not sent");
                return Submitted::Dropped;
            }
            None => {
                warn!(device = %item.device, "~~X device not known, {item} was not sent");
                return Submitted::Dropped;
            }
        };

        if item.delay.is_zero() {
            return if deliver(&tx, item) { Submitted::Routed } else { Submitted::Dropped };
        }

        let delay = item.delay;
        debug!(device = %item.device, "{item} delayed by {:.3}s", delay.as_secs_f64());
        match PausableTimer::start(delay, move || {
            deliver(&tx, item);
        }) {
            Ok(timer) => {
                self.timers.push(timer);
                Submitted::Delayed
            }
            Err(e) => {
                warn!("cannot schedule delayed send: {e}");
                Submitted::Dropped
            }
        }
    }

    fn control(&mut self, token: ControlToken) {
        match token {
            ControlToken::Pause => {
                self.timers.iter().for_each(|t| {
                    t.pause();
                });
                info!(timers = self.timers.len(), "delayed sends paused");
            }
            ControlToken::Resume => {
                self.timers.iter().for_each(PausableTimer::resume);
                info!(timers = self.timers.len(), "delayed sends resumed");
            }
            ControlToken::Next => debug!("next: no effect on delayed sends"),
        }
    }

    /// Cancel delayed sends, then stop all workers.
    ///
    /// Each worker gets `join_grace` to finish; one that is still running
    /// afterwards is detached and may hold its connection a little longer.
    pub fn stop(self) {
        info!("stopping timers ...");
        for t in &self.timers {
            t.cancel();
        }

        info!("stopping workers ...");
        for w in &self.workers {
            w.signal_stop();
        }

        // `None`: a grace past the end of the clock waits for every worker.
        let deadline = Instant::now().checked_add(self.join_grace);
        let mut workers = self.workers;
        while !workers.is_empty() {
            let (done, running): (Vec<_>, Vec<_>) = workers.into_iter().partition(WorkerHandle::is_finished);
            for w in done {
                let device = w.device().to_string();
                match w.join() {
                    Ok(()) => debug!(device = %device, "worker joined"),
                    Err(e) => debug!(device = %device, "worker had ended with: {e}"),
                }
            }
            workers = running;
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        for w in workers {
            warn!(device = %w.device(), "worker still running after {:.1}s, detaching", self.join_grace.as_secs_f64());
        }
        info!("dispatcher stopped");
    }

    /// Serve `submissions` until `stop` is set or every sender is gone.
    pub fn run(mut self, submissions: Receiver<Submission>, stop: StopSignal) {
        while !stop.is_set() {
            match submissions.recv_timeout(POLL_INTERVAL) {
                Ok(s) => {
                    self.submit(s);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("submission channel closed");
                    break;
                }
            }
        }
        self.stop();
    }
}

fn deliver(tx: &Sender<CommandSendItem>, item: CommandSendItem) -> bool {
    let device = item.device.clone();
    match tx.send(item) {
        Ok(()) => true,
        Err(e) => {
            warn!(device = %device, "~~X worker has stopped, {} was not sent", e.0);
            false
        }
    }
}
