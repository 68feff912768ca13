//! Thread and process boundary around the [`Dispatcher`].
//!
//! A [`ControlLink`] offers the same calls whether the dispatcher runs on a
//! thread of the caller or in an `avcontrol-bridge` child process. In
//! process mode submissions and answers cross the pipe as JSON lines:
//! ```text
//! stdin   {"device":"Denon DN-500BD","command":"Play","request":false}
//! stdin   "pause"
//! stdout  {"device":"Denon DN-500BD","command":"Play","values":{},"message_type":"command_success"}
//! ```
//! The child logs to stderr, which is inherited.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::devices::Registry;
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::error::BridgeError;
use crate::item::{CommandAnswerItem, Submission};
use crate::signal::StopSignal;

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Serialize `value` as one line, newline included.
pub fn encode_line<T: Serialize>(value: &T) -> Result<String, BridgeError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, BridgeError> {
    Ok(serde_json::from_str(line.trim())?)
}

// ---------------------------------------------------------------------------
// Control link
// ---------------------------------------------------------------------------

enum Backend {
    Thread {
        submissions: Sender<Submission>,
        stop: StopSignal,
        join: JoinHandle<()>,
    },
    Process {
        child: Child,
        stdin: ChildStdin,
        reader: JoinHandle<()>,
    },
}

/// Handle to a running dispatcher.
pub struct ControlLink {
    backend: Backend,
    answers: Receiver<CommandAnswerItem>,
}

impl ControlLink {
    /// Run the dispatcher on a thread of this process.
    pub fn spawn_thread(registry: Registry, config: DispatchConfig) -> io::Result<Self> {
        let (answers_tx, answers) = mpsc::channel();
        let (submissions, rx) = mpsc::channel();
        let stop = StopSignal::new();
        let join = {
            let stop = stop.clone();
            thread::Builder::new().name("dispatcher".into()).spawn(move || {
                info!("dispatcher started in thread mode");
                Dispatcher::start(&registry, &config, answers_tx).run(rx, stop);
            })?
        };
        Ok(Self { backend: Backend::Thread { submissions, stop, join }, answers })
    }

    /// Run `program --config <config>` as a child process.
    pub fn spawn_process(program: &Path, config: &Path) -> Result<Self, BridgeError> {
        let mut cmd = Command::new(program);
        cmd.arg("--config").arg(config);
        Self::spawn_command(cmd)
    }

    /// Run an arbitrary command speaking the JSON-lines protocol.
    pub fn spawn_command(mut cmd: Command) -> Result<Self, BridgeError> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(BridgeError::Closed);
        };
        info!(pid = child.id(), "dispatcher started in process mode");

        let (tx, answers) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("bridge reader".into())
            .spawn(move || read_answers(BufReader::new(stdout), &tx))?;
        Ok(Self { backend: Backend::Process { child, stdin, reader }, answers })
    }

    /// Hand an item or control token to the dispatcher.
    pub fn submit(&mut self, submission: impl Into<Submission>) -> Result<(), BridgeError> {
        let submission = submission.into();
        match &mut self.backend {
            Backend::Thread { submissions, .. } => {
                submissions.send(submission).map_err(|_| BridgeError::Closed)
            }
            Backend::Process { stdin, .. } => {
                stdin.write_all(encode_line(&submission)?.as_bytes())?;
                stdin.flush()?;
                Ok(())
            }
        }
    }

    /// Next answer, waiting up to `timeout`.
    pub fn recv_answer(&self, timeout: Duration) -> Result<Option<CommandAnswerItem>, BridgeError> {
        match self.answers.recv_timeout(timeout) {
            Ok(a) => Ok(Some(a)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BridgeError::Closed),
        }
    }

    pub fn try_recv_answer(&self) -> Option<CommandAnswerItem> {
        self.answers.try_recv().ok()
    }

    /// Stop the dispatcher and wait for it.
    ///
    /// In process mode a non-zero exit status is [`BridgeError::Exited`].
    pub fn shutdown(self) -> Result<(), BridgeError> {
        match self.backend {
            Backend::Thread { submissions, stop, join } => {
                stop.set();
                drop(submissions);
                join.join().map_err(|_| BridgeError::Closed)
            }
            Backend::Process { mut child, stdin, reader } => {
                // EOF on stdin stops the child.
                drop(stdin);
                let status = child.wait()?;
                debug!(%status, "bridge process exited");
                if reader.join().is_err() {
                    warn!("bridge reader panicked");
                }
                if status.success() { Ok(()) } else { Err(BridgeError::Exited(status)) }
            }
        }
    }
}

fn read_answers(reader: impl BufRead, tx: &Sender<CommandAnswerItem>) {
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("bridge pipe read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<CommandAnswerItem>(&line) {
            Ok(answer) => {
                if tx.send(answer).is_err() {
                    break;
                }
            }
            Err(e) => warn!("ignoring line from bridge: {e}: {line}"),
        }
    }
    debug!("bridge output closed");
}
