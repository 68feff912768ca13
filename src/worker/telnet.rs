//! Telnet line protocol with echo correlation.
//!
//! Models devices like the Atlona AT-OME-SW32, which echo every line before
//! answering it:
//! ```text
//! -> x2AVx1\r
//! <- x2AVx1\r\n                          echo, not reported
//! <- x2AVx1\r\n                          reply to the pending command
//! <- Command FAILED: (x2AVx9)\r\n        or a failure reply
//! ```
//! Correlation is positional, so only one command is in flight at a time.
//! Lines arriving while nothing is pending are status pushes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::conn::{Connector, Endpoint, Link};
use crate::error::TransportError;
use crate::frame::{LineSplitter, TelnetFilter, escape_iac};
use crate::item::{AnswerValues, ComType, CommandSendItem};
use crate::value::Value;

use super::{Transport, WorkerContext};

/// Grammar and timing of one telnet device.
#[derive(Debug, Clone)]
pub struct TelnetProfile {
    pub end_seq: String,
    /// Line that completes the login, if the device sends one.
    pub banner: Option<String>,
    pub login_timeout: Duration,
    /// Matches failure replies; group 1, if present, is the reason.
    pub error_seq: Regex,
    /// Minimum time between two writes.
    pub send_interval: Duration,
    /// A pending command without reply after this long is reported failed.
    pub reply_timeout: Duration,
    pub read_timeout: Duration,
}

impl TelnetProfile {
    /// Atlona AT-OME-SW32.
    pub fn atlona() -> Result<Self, regex::Error> {
        Ok(Self {
            end_seq: "\r".into(),
            banner: Some("Welcome to TELNET.".into()),
            login_timeout: Duration::from_secs(5),
            error_seq: Regex::new(r"Command FAILED: \((.*)\)")?,
            send_interval: Duration::from_millis(500),
            reply_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(50),
        })
    }
}

/// The one command awaiting its echo and reply.
#[derive(Debug)]
struct Pending {
    item: CommandSendItem,
    /// Written line without terminator.
    echo: String,
    sent_at: Instant,
    echoed: bool,
}

/// Telnet transport.
pub struct TelnetTransport {
    endpoint: Endpoint,
    connector: Box<dyn Connector>,
    profile: TelnetProfile,
    link: Option<Box<dyn Link>>,
    filter: TelnetFilter,
    splitter: LineSplitter,
    /// Lines read during login after the banner.
    backlog: VecDeque<String>,
    pending: Option<Pending>,
    last_send_at: Option<Instant>,
}

impl TelnetTransport {
    pub fn new(endpoint: Endpoint, connector: Box<dyn Connector>, profile: TelnetProfile) -> Self {
        Self {
            endpoint,
            connector,
            profile,
            link: None,
            filter: TelnetFilter::new(),
            splitter: LineSplitter::new(),
            backlog: VecDeque::new(),
            pending: None,
            last_send_at: None,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>, TransportError> {
        self.link.as_mut().ok_or(TransportError::Disconnected)
    }

    /// Read once, answer option negotiation, return complete lines.
    fn read_lines(&mut self, timeout: Duration) -> Result<Vec<String>, TransportError> {
        let Some(bytes) = self.link()?.recv_timeout(timeout)? else {
            return Ok(Vec::new());
        };
        let filtered = self.filter.filter(&bytes);
        if !filtered.replies.is_empty() {
            self.link()?.send(&filtered.replies)?;
        }
        Ok(self.splitter.feed(&filtered.data))
    }

    fn await_banner(&mut self, ctx: &WorkerContext, banner: &str) -> Result<(), TransportError> {
        let deadline = Instant::now().checked_add(self.profile.login_timeout);
        loop {
            if ctx.stop.is_set() {
                return Ok(());
            }
            let left = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            if left.is_some_and(|l| l.is_zero()) {
                return Err(TransportError::Login { timeout: self.profile.login_timeout });
            }
            let wait = left.map_or(self.profile.read_timeout, |l| l.min(self.profile.read_timeout));
            let mut lines = self.read_lines(wait)?.into_iter();
            while let Some(line) = lines.next() {
                if line.contains(banner) {
                    debug!(device = %ctx.device, "login complete");
                    self.backlog.extend(lines);
                    return Ok(());
                }
                debug!(device = %ctx.device, "before login: {line:?}");
            }
        }
    }

    fn can_send(&self) -> bool {
        self.pending.is_none()
            && self.last_send_at.is_none_or(|t| t.elapsed() >= self.profile.send_interval)
    }

    fn send_item(&mut self, ctx: &WorkerContext, item: CommandSendItem) -> Result<(), TransportError> {
        let composed = match ctx.templates.compose(&item) {
            Ok(c) => c,
            Err(e) => return ctx.answers.failed(&item, &e),
        };
        let mut wire = composed.message;
        if !wire.ends_with(&self.profile.end_seq) {
            wire.push_str(&self.profile.end_seq);
        }
        debug!(device = %ctx.device, wire = ?wire, "send");
        self.link()?.send(&escape_iac(wire.as_bytes()))?;
        info!(device = %ctx.device, "~~> {item}");

        let echo = wire.trim_end_matches(['\r', '\n']).to_string();
        let now = Instant::now();
        self.pending = Some(Pending { echoed: echo.is_empty(), item, echo, sent_at: now });
        self.last_send_at = Some(now);
        Ok(())
    }

    fn expire_pending(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| p.sent_at.elapsed() >= self.profile.reply_timeout);
        if !expired {
            return Ok(());
        }
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        warn!(
            device = %ctx.device,
            "no reply to {} within {:?}",
            p.item.command, self.profile.reply_timeout
        );
        ctx.answers.emit(
            Some(&p.item.command),
            AnswerValues::raw("timeout"),
            ComType::outcome(p.item.request, false),
        )
    }

    fn handle_line(&mut self, ctx: &WorkerContext, line: &str) -> Result<(), TransportError> {
        debug!(device = %ctx.device, raw = ?line, "analyzing");
        match self.pending.as_mut() {
            Some(p) if !p.echoed => {
                if line.contains(&p.echo) {
                    p.echoed = true;
                    debug!(device = %ctx.device, "echo of {:?} received", p.item.command);
                    Ok(())
                } else {
                    self.status(ctx, line)
                }
            }
            Some(_) => match self.pending.take() {
                Some(p) => self.reply(ctx, p, line),
                None => Ok(()),
            },
            None => self.status(ctx, line),
        }
    }

    fn reply(&self, ctx: &WorkerContext, pending: Pending, line: &str) -> Result<(), TransportError> {
        let failure = self.profile.error_seq.captures(line);
        let ok = failure.is_none();
        let ty = ComType::outcome(pending.item.request, ok);
        let command = pending.item.command.as_str();
        let Some(template) = ctx.templates.get(command) else {
            return ctx.answers.emit(Some(command), AnswerValues::raw(line), ty);
        };
        let values = match template.analyze(line, &[]) {
            Ok(Some(values)) => AnswerValues::Mapped(values),
            Ok(None) => match failure {
                Some(caps) => {
                    let reason = caps.get(1).map_or(line, |m| m.as_str());
                    AnswerValues::Raw(vec![Value::from(reason)])
                }
                None => AnswerValues::empty(),
            },
            Err(e) => {
                warn!(device = %ctx.device, "error analyzing {line:?}: {e}");
                return ctx.answers.unidentifiable(vec![Value::from(line)]);
            }
        };
        ctx.answers.emit(Some(&template.name), values, ty)
    }

    /// Unsolicited line: best-effort template match.
    fn status(&self, ctx: &WorkerContext, line: &str) -> Result<(), TransportError> {
        match ctx.templates.identify(line, &[]) {
            Some((template, Ok(values))) => ctx.answers.emit(
                Some(&template.name),
                AnswerValues::Mapped(values),
                ComType::MessageStatus,
            ),
            _ => ctx.answers.emit(None, AnswerValues::raw(line), ComType::MessageStatus),
        }
    }
}

impl Transport for TelnetTransport {
    fn connect(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        debug!(device = %ctx.device, endpoint = %self.endpoint, "opening telnet session");
        self.link = Some(self.connector.connect(&self.endpoint)?);
        if let Some(banner) = self.profile.banner.clone() {
            self.await_banner(ctx, &banner)?;
        }
        Ok(())
    }

    fn poll(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        self.expire_pending(ctx)?;
        if self.can_send()
            && let Some(item) = ctx.try_next()
        {
            self.send_item(ctx, item)?;
        }
        while let Some(line) = self.backlog.pop_front() {
            self.handle_line(ctx, &line)?;
        }
        let timeout = self.profile.read_timeout;
        for line in self.read_lines(timeout)? {
            self.handle_line(ctx, &line)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        self.filter.reset();
        self.splitter.clear();
        self.backlog.clear();
        self.pending = None;
        self.last_send_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::frame::{IAC, WONT};
    use crate::template::{ArgumentKind, CommandTemplate, PrimitiveType, TemplateSet};
    use crate::testing::{self, ScriptedDevice};

    fn atlona_set() -> TemplateSet {
        let int = || ArgumentKind::Primitive(PrimitiveType::Int);
        TemplateSet::from_templates(
            "atlona",
            [
                CommandTemplate::new("Status")
                    .with_request("Status")
                    .with_analysis(r"x(\d)AVx(\d)")
                    .with_argument("input", int())
                    .with_argument("output", int()),
                CommandTemplate::new("Set Output")
                    .with_command("x{}AVx{}")
                    .with_analysis(r"x(\d)AVx(\d)")
                    .with_argument("input", int())
                    .with_argument("output", int()),
                CommandTemplate::new("Lock").with_command("Lock").with_analysis("^Lock$"),
            ],
        )
    }

    fn fast_profile() -> TelnetProfile {
        TelnetProfile {
            banner: None,
            send_interval: Duration::ZERO,
            ..TelnetProfile::atlona().unwrap()
        }
    }

    fn transport(device: &ScriptedDevice, profile: TelnetProfile) -> TelnetTransport {
        TelnetTransport::new(Endpoint::new("atlona", 23), Box::new(device.clone()), profile)
    }

    fn pump(t: &mut TelnetTransport, ctx: &WorkerContext, rounds: usize) {
        for _ in 0..rounds {
            t.poll(ctx).unwrap();
        }
    }

    /// Echo the written line, then send `reply`.
    fn echo_then(reply: &'static [u8]) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
        move |written: &[u8]| {
            let mut echo = written.to_vec();
            echo.push(b'\n');
            vec![echo, reply.to_vec()]
        }
    }

    #[test]
    fn echo_is_suppressed_and_reply_reported_once() {
        let device = ScriptedDevice::new().respond_with(echo_then(b"x2AVx1\r\n"));
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let mut t = transport(&device, fast_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue
            .send(CommandSendItem::command("Atlona", "Set Output").with_args([2, 1]))
            .unwrap();
        pump(&mut t, &ctx, 1);
        assert!(testing::drain(&rx).is_empty(), "echo must not produce an answer");

        pump(&mut t, &ctx, 2);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].command.as_deref(), Some("Set Output"));
        assert_eq!(answers[0].message_type, ComType::CommandSuccess);
        assert_eq!(answers[0].values.get("input"), Some(&Value::Int(2)));
        assert_eq!(device.written_text(), vec!["x2AVx1\r"]);
    }

    #[test]
    fn error_reply_is_failure_with_reason() {
        let device = ScriptedDevice::new().respond_with(echo_then(b"Command FAILED: (x1AVx3)\r\n"));
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let mut t = transport(&device, fast_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue
            .send(CommandSendItem::command("Atlona", "Set Output").with_args([1, 3]))
            .unwrap();
        pump(&mut t, &ctx, 3);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::CommandFailed);
    }

    #[test]
    fn one_command_in_flight() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let mut t = transport(&device, fast_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::command("Atlona", "Lock")).unwrap();
        ctx.requeue.send(CommandSendItem::request("Atlona", "Status")).unwrap();
        pump(&mut t, &ctx, 3);
        assert_eq!(device.written_text(), vec!["Lock\r"]);

        device.push(b"Lock\r\nLock\r\n");
        pump(&mut t, &ctx, 2);
        assert_eq!(device.written_text(), vec!["Lock\r", "Status\r"]);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::CommandSuccess);
    }

    #[test]
    fn send_interval_is_respected() {
        let device = ScriptedDevice::new().respond_with(echo_then(b"Lock\r\n"));
        let (ctx, _rx) = testing::context("Atlona", atlona_set());
        let profile = TelnetProfile { send_interval: Duration::from_millis(80), ..fast_profile() };
        let mut t = transport(&device, profile);
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::command("Atlona", "Lock")).unwrap();
        ctx.requeue.send(CommandSendItem::command("Atlona", "Lock")).unwrap();
        pump(&mut t, &ctx, 3);
        assert_eq!(device.written().len(), 1);
        std::thread::sleep(Duration::from_millis(100));
        pump(&mut t, &ctx, 1);
        assert_eq!(device.written().len(), 2);
    }

    #[test]
    fn missing_reply_times_out_and_releases_gate() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let profile = TelnetProfile { reply_timeout: Duration::from_millis(30), ..fast_profile() };
        let mut t = transport(&device, profile);
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::request("Atlona", "Status")).unwrap();
        ctx.requeue.send(CommandSendItem::command("Atlona", "Lock")).unwrap();
        pump(&mut t, &ctx, 1);
        std::thread::sleep(Duration::from_millis(50));
        pump(&mut t, &ctx, 1);

        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::RequestFailed);
        assert_eq!(answers[0].values, AnswerValues::raw("timeout"));
        assert_eq!(device.written_text(), vec!["Status\r", "Lock\r"]);
    }

    #[test]
    fn idle_line_is_status_push() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let mut t = transport(&device, fast_profile());
        t.connect(&ctx).unwrap();

        device.push(b"x3AVx1\r\nPower button pressed\r\n");
        pump(&mut t, &ctx, 1);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].command.as_deref(), Some("Status"));
        assert_eq!(answers[0].message_type, ComType::MessageStatus);
        assert_eq!(answers[1].command, None);
        assert_eq!(answers[1].message_type, ComType::MessageStatus);
    }

    #[test]
    fn login_waits_for_banner_and_refuses_options() {
        let device = ScriptedDevice::new();
        device.push(&[IAC, crate::frame::DO, 24]);
        device.push(b"Welcome to TELNET.\r\nx1AVx1\r\n");
        let (ctx, rx) = testing::context("Atlona", atlona_set());
        let mut t = transport(&device, TelnetProfile::atlona().unwrap());
        t.connect(&ctx).unwrap();
        assert_eq!(device.written(), vec![vec![IAC, WONT, 24]]);

        // The line after the banner is handled on the first poll.
        pump(&mut t, &ctx, 1);
        assert_eq!(testing::drain(&rx).len(), 1);
    }

    #[test]
    fn login_timeout_is_recoverable() {
        let device = ScriptedDevice::new();
        let (ctx, _rx) = testing::context("Atlona", atlona_set());
        let profile = TelnetProfile {
            login_timeout: Duration::from_millis(20),
            ..TelnetProfile::atlona().unwrap()
        };
        let mut t = transport(&device, profile);
        let err = t.connect(&ctx).unwrap_err();
        assert!(matches!(err, TransportError::Login { .. }));
        assert_eq!(err.kind(), ErrorKind::Recoverable);
    }
}
