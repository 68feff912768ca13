//! Line protocol over TCP with acknowledgement replies.
//!
//! Models devices like the Denon DN-500BD:
//! ```text
//! -> @0?ST\r
//! <- ack+@0STPL\r          reply to the last command
//! <- @0CDTC\r              unsolicited status push
//! <- nack\r                last command rejected
//! ```
//! One read may carry several messages; a split expression extracts them.

use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::conn::{Connector, Endpoint, Link};
use crate::error::TransportError;
use crate::frame::LineSplitter;
use crate::item::{AnswerValues, ComType, CommandSendItem};
use crate::value::Value;

use super::{Transport, WorkerContext};

/// Grammar of one line-protocol device.
#[derive(Debug, Clone)]
pub struct LineProfile {
    /// Prefixed to every outgoing message unless already present.
    pub start_seq: String,
    /// Appended to every outgoing message unless already present.
    pub end_seq: String,
    /// Extracts individual messages from a received line.
    pub split: Regex,
    pub ack_prefix: String,
    pub nack: String,
    pub status_prefix: String,
    /// Reply meaning the device could not execute the last command.
    pub error_seq: Option<String>,
    /// Identical fragments closer together than this are dropped.
    pub duplicate_window: Duration,
    pub read_timeout: Duration,
}

/// What a received fragment is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragment {
    Ack,
    Nack,
    Status,
    Other,
}

impl LineProfile {
    /// Denon DN-500BD.
    pub fn denon() -> Result<Self, regex::Error> {
        Ok(Self {
            start_seq: "@0".into(),
            end_seq: "\r".into(),
            split: Regex::new(r"(?:ack\+@|@0\??|ack\+|nack|ack)\w*")?,
            ack_prefix: "ack".into(),
            nack: "nack".into(),
            status_prefix: "@0".into(),
            error_seq: Some("@0BDERBUSY".into()),
            duplicate_window: Duration::from_millis(500),
            read_timeout: Duration::from_millis(50),
        })
    }

    /// Wrap `message` with the start and end sequences. Idempotent.
    pub fn wrap(&self, message: &str) -> String {
        let mut out = String::with_capacity(message.len() + 4);
        if !message.starts_with(&self.start_seq) {
            out.push_str(&self.start_seq);
        }
        out.push_str(message);
        if !message.ends_with(&self.end_seq) {
            out.push_str(&self.end_seq);
        }
        out
    }

    pub fn classify(&self, fragment: &str) -> Fragment {
        if fragment == self.nack || self.error_seq.as_deref() == Some(fragment) {
            Fragment::Nack
        } else if fragment.starts_with(&self.ack_prefix) {
            Fragment::Ack
        } else if fragment.starts_with(&self.status_prefix) {
            Fragment::Status
        } else {
            Fragment::Other
        }
    }
}

/// The last item written, kept for correlating acknowledgements.
#[derive(Debug, Clone)]
struct Sent {
    item: CommandSendItem,
    wire: String,
}

/// Line-protocol transport.
pub struct TcpTransport {
    endpoint: Endpoint,
    connector: Box<dyn Connector>,
    profile: LineProfile,
    link: Option<Box<dyn Link>>,
    splitter: LineSplitter,
    last_sent: Option<Sent>,
    last_fragment: Option<(String, Instant)>,
}

impl TcpTransport {
    pub fn new(endpoint: Endpoint, connector: Box<dyn Connector>, profile: LineProfile) -> Self {
        Self {
            endpoint,
            connector,
            profile,
            link: None,
            splitter: LineSplitter::new(),
            last_sent: None,
            last_fragment: None,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>, TransportError> {
        self.link.as_mut().ok_or(TransportError::Disconnected)
    }

    fn send_item(&mut self, ctx: &WorkerContext, item: CommandSendItem) -> Result<(), TransportError> {
        let composed = match ctx.templates.compose(&item) {
            Ok(c) => c,
            Err(e) => return ctx.answers.failed(&item, &e),
        };
        if !composed.payload.is_empty() {
            debug!(device = %ctx.device, "ignoring {} surplus argument(s)", composed.payload.len());
        }
        let wire = self.profile.wrap(&composed.message);
        debug!(device = %ctx.device, wire = ?wire, "send");
        self.link()?.send(wire.as_bytes())?;
        info!(device = %ctx.device, "~~> {item}");
        self.last_fragment = None;
        self.last_sent = Some(Sent { item, wire });
        Ok(())
    }

    fn analyze_line(&mut self, ctx: &WorkerContext, line: &str) -> Result<(), TransportError> {
        debug!(device = %ctx.device, raw = ?line, "analyzing");
        let residue = self.profile.split.replace_all(line, "");
        let residue = residue.trim();
        if !residue.is_empty() {
            match &self.last_sent {
                Some(sent) if sent.wire.contains(residue) => {
                    debug!(device = %ctx.device, "echo of {:?} skipped", sent.item.command);
                }
                _ => {
                    warn!(device = %ctx.device, "cannot classify {residue:?}");
                    ctx.answers.unidentifiable(vec![Value::from(residue)])?;
                }
            }
        }

        let fragments: Vec<String> =
            self.profile.split.find_iter(line).map(|m| m.as_str().to_string()).collect();
        for fragment in fragments {
            self.analyze_fragment(ctx, &fragment)?;
        }
        Ok(())
    }

    fn analyze_fragment(&mut self, ctx: &WorkerContext, fragment: &str) -> Result<(), TransportError> {
        // The player repeats some messages; drop the second copy.
        if let Some((prev, at)) = &self.last_fragment
            && prev == fragment
            && at.elapsed() < self.profile.duplicate_window
        {
            debug!(device = %ctx.device, "duplicate {fragment:?} skipped");
            return Ok(());
        }
        self.last_fragment = Some((fragment.to_string(), Instant::now()));

        match self.profile.classify(fragment) {
            kind @ (Fragment::Ack | Fragment::Nack) => {
                let ok = kind == Fragment::Ack;
                let Some(sent) = &self.last_sent else {
                    let ty = if ok { ComType::Success } else { ComType::Failed };
                    return ctx.answers.emit(None, AnswerValues::raw(fragment), ty);
                };
                let ty = ComType::outcome(sent.item.request, ok);
                let Some(template) = ctx.templates.get(&sent.item.command) else {
                    return ctx.answers.emit(Some(&sent.item.command), AnswerValues::raw(fragment), ty);
                };
                match template.analyze(fragment, &[]) {
                    Ok(Some(values)) => ctx.answers.emit(Some(&template.name), AnswerValues::Mapped(values), ty),
                    Ok(None) => ctx.answers.emit(Some(&template.name), AnswerValues::empty(), ty),
                    Err(e) => {
                        warn!(device = %ctx.device, "error analyzing {fragment:?}: {e}");
                        ctx.answers.unidentifiable(vec![Value::from(fragment)])
                    }
                }
            }
            Fragment::Status => match ctx.templates.identify(fragment, &[]) {
                Some((template, Ok(values))) => ctx.answers.emit(
                    Some(&template.name),
                    AnswerValues::Mapped(values),
                    ComType::MessageStatus,
                ),
                Some((_, Err(e))) => {
                    warn!(device = %ctx.device, "error analyzing {fragment:?}: {e}");
                    ctx.answers.unidentifiable(vec![Value::from(fragment)])
                }
                None => ctx.answers.unidentifiable(vec![Value::from(fragment)]),
            },
            Fragment::Other => ctx.answers.unidentifiable(vec![Value::from(fragment)]),
        }
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        debug!(device = %ctx.device, endpoint = %self.endpoint, "opening tcp connection");
        self.link = Some(self.connector.connect(&self.endpoint)?);
        Ok(())
    }

    fn poll(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        if let Some(item) = ctx.try_next() {
            self.send_item(ctx, item)?;
        }
        let timeout = self.profile.read_timeout;
        if let Some(data) = self.link()?.recv_timeout(timeout)? {
            for line in self.splitter.feed(&data) {
                self.analyze_line(ctx, &line)?;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
        self.splitter.clear();
        self.last_sent = None;
        self.last_fragment = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{CommandTemplate, TemplateSet};
    use crate::testing::{self, ScriptedDevice};

    fn play_set() -> TemplateSet {
        TemplateSet::from_templates(
            "denon",
            [
                CommandTemplate::new("Play").with_command("PLAY").with_analysis("^ack$"),
                CommandTemplate::new("Status")
                    .with_request("?ST")
                    .with_analysis(r"@0ST(\w+)")
                    .with_argument("state", crate::template::ArgumentKind::Primitive(
                        crate::template::PrimitiveType::Str,
                    )),
            ],
        )
    }

    fn plain_profile() -> LineProfile {
        LineProfile { start_seq: String::new(), ..LineProfile::denon().unwrap() }
    }

    fn connected(device: &ScriptedDevice, profile: LineProfile) -> TcpTransport {
        TcpTransport::new(Endpoint::new("denon", 9030), Box::new(device.clone()), profile)
    }

    fn pump(t: &mut TcpTransport, ctx: &WorkerContext, rounds: usize) {
        for _ in 0..rounds {
            t.poll(ctx).unwrap();
        }
    }

    #[test]
    fn wrap_is_idempotent() {
        let p = LineProfile::denon().unwrap();
        assert_eq!(p.wrap("?ST"), "@0?ST\r");
        assert_eq!(p.wrap("@0?ST\r"), "@0?ST\r");
    }

    #[test]
    fn classification() {
        let p = LineProfile::denon().unwrap();
        assert_eq!(p.classify("nack"), Fragment::Nack);
        assert_eq!(p.classify("@0BDERBUSY"), Fragment::Nack);
        assert_eq!(p.classify("ack+@0STPL"), Fragment::Ack);
        assert_eq!(p.classify("@0CDTC"), Fragment::Status);
        assert_eq!(p.classify("hello"), Fragment::Other);
    }

    #[test]
    fn echo_then_ack_gives_one_command_success() {
        let device = ScriptedDevice::new().respond_with(|_| vec![b"PLAY\r".to_vec(), b"ack\r".to_vec()]);
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, plain_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::command("Denon", "Play")).unwrap();
        pump(&mut t, &ctx, 4);

        assert_eq!(device.written_text(), vec!["PLAY\r"]);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1, "{answers:?}");
        assert_eq!(answers[0].device, "Denon");
        assert_eq!(answers[0].command.as_deref(), Some("Play"));
        assert_eq!(answers[0].values, AnswerValues::empty());
        assert_eq!(answers[0].message_type, ComType::CommandSuccess);
    }

    #[test]
    fn nack_gives_failure_by_item_kind() {
        let device = ScriptedDevice::new().respond_with(|_| vec![b"PLAY\r".to_vec(), b"nack\r".to_vec()]);
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, plain_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::command("Denon", "Play")).unwrap();
        pump(&mut t, &ctx, 4);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::CommandFailed);

        ctx.requeue.send(CommandSendItem::request("Denon", "Status")).unwrap();
        pump(&mut t, &ctx, 4);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].command.as_deref(), Some("Status"));
        assert_eq!(answers[0].message_type, ComType::RequestFailed);
    }

    #[test]
    fn ack_and_status_in_one_read() {
        let device = ScriptedDevice::new().respond_with(|_| vec![b"ack+@0STPL\r@0CDTC\r".to_vec()]);
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, LineProfile::denon().unwrap());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::request("Denon", "Status")).unwrap();
        pump(&mut t, &ctx, 3);

        assert_eq!(device.written_text(), vec!["@0?ST\r"]);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 2, "{answers:?}");
        assert_eq!(answers[0].message_type, ComType::RequestSuccess);
        assert_eq!(answers[0].values.get("state"), Some(&Value::from("PL")));
        // No template decodes the disc status in this set.
        assert_eq!(answers[1].message_type, ComType::Unidentifiable);
        assert_eq!(answers[1].values, AnswerValues::raw("@0CDTC"));
    }

    #[test]
    fn status_push_resolved_by_template_scan() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, LineProfile::denon().unwrap());
        t.connect(&ctx).unwrap();

        device.push(b"@0STPP\r");
        pump(&mut t, &ctx, 2);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].command.as_deref(), Some("Status"));
        assert_eq!(answers[0].message_type, ComType::MessageStatus);
    }

    #[test]
    fn duplicate_status_suppressed() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, LineProfile::denon().unwrap());
        t.connect(&ctx).unwrap();

        device.push(b"@0STPL\r@0STPL\r");
        pump(&mut t, &ctx, 2);
        assert_eq!(testing::drain(&rx).len(), 1);
    }

    #[test]
    fn duplicate_outside_window_is_kept() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Denon", play_set());
        let profile = LineProfile { duplicate_window: Duration::from_millis(20), ..LineProfile::denon().unwrap() };
        let mut t = connected(&device, profile);
        t.connect(&ctx).unwrap();

        device.push(b"@0STPL\r");
        pump(&mut t, &ctx, 1);
        std::thread::sleep(Duration::from_millis(40));
        device.push(b"@0STPL\r");
        pump(&mut t, &ctx, 1);
        assert_eq!(testing::drain(&rx).len(), 2);
    }

    #[test]
    fn composition_failure_sends_nothing() {
        let device = ScriptedDevice::new();
        let (ctx, rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, LineProfile::denon().unwrap());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::command("Denon", "Eject")).unwrap();
        pump(&mut t, &ctx, 1);
        assert!(device.written().is_empty());
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::Failed);
        assert_eq!(answers[0].command.as_deref(), Some("Eject"));
    }

    #[test]
    fn closed_connection_is_recoverable() {
        let device = ScriptedDevice::new();
        let (ctx, _rx) = testing::context("Denon", play_set());
        let mut t = connected(&device, LineProfile::denon().unwrap());
        t.connect(&ctx).unwrap();
        device.close();
        let err = t.poll(&ctx).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Recoverable);
    }
}
