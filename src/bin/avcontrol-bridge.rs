//! Dispatcher host for process mode.
//!
//! Reads JSON-line submissions on stdin, writes JSON-line answers on stdout
//! and logs to stderr. End of input stops the dispatcher.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;

use avcontrol::bridge::{decode_line, encode_line};
use avcontrol::config::BridgeConfig;
use avcontrol::devices::Registry;
use avcontrol::dispatch::Dispatcher;
use avcontrol::item::{CommandAnswerItem, Submission};
use avcontrol::signal::StopSignal;
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(version, about = "Serve AV device control over stdin/stdout", long_about = None)]
struct Args {
    #[arg(long, value_name = "FILE", env = "AVCONTROL_CONFIG", help = "Bridge configuration (YAML)")]
    config: PathBuf,

    #[arg(long, default_value = "info", env = "AVCONTROL_LOG", help = "Log filter when RUST_LOG is unset")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    avcontrol::logging::init(&args.log_level);

    let config = match BridgeConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(pid = std::process::id(), devices = config.devices.len(), "bridge starting");

    let (answers_tx, answers_rx) = mpsc::channel::<CommandAnswerItem>();
    let dispatcher = Dispatcher::start(&Registry::builtin(), &config.dispatch_config(), answers_tx);

    // Not joined: a detached worker may keep its answer sender alive.
    let _writer = thread::Builder::new().name("answer writer".into()).spawn(move || {
        let stdout = io::stdout();
        for answer in answers_rx {
            let line = match encode_line(&answer) {
                Ok(l) => l,
                Err(e) => {
                    warn!("cannot encode {answer}: {e}");
                    continue;
                }
            };
            let mut out = stdout.lock();
            if out.write_all(line.as_bytes()).and_then(|()| out.flush()).is_err() {
                break;
            }
        }
    });

    let (sub_tx, sub_rx) = mpsc::channel();
    let stop = StopSignal::new();
    let runner = {
        let stop = stop.clone();
        thread::Builder::new().name("dispatcher".into()).spawn(move || dispatcher.run(sub_rx, stop))
    };
    let runner = match runner {
        Ok(r) => r,
        Err(e) => {
            error!("cannot start dispatcher thread: {e}");
            return ExitCode::FAILURE;
        }
    };

    for line in io::stdin().lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match decode_line::<Submission>(&line) {
            Ok(s) => {
                if sub_tx.send(s).is_err() {
                    break;
                }
            }
            Err(e) => warn!("ignoring submission: {e}: {line}"),
        }
    }

    info!("input closed, stopping");
    stop.set();
    if runner.join().is_err() {
        error!("dispatcher thread panicked");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
