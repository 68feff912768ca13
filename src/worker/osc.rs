//! OSC over UDP.
//!
//! Models consoles like the Behringer X32. Composition yields an address plus
//! an argument payload:
//! ```text
//! item  Fader(5, 0.75)          -> /ch/05/mix/fader ,f 0.75
//! reply /ch/05/mix/fader ,f 0.75 -> {channel: 5, level: 0.75}
//! ```
//! Every message goes out from a fresh socket bound to an ephemeral port, so
//! only replies addressed to that port are read. The socket is serviced
//! until the next item is queued.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use crate::conn::Endpoint;
use crate::error::TransportError;
use crate::item::{AnswerValues, ComType, CommandSendItem};
use crate::timer::RepeatingTimer;
use crate::value::Value;

use super::{Transport, WorkerContext};

/// Receive buffer size; X32 replies fit in one Ethernet frame.
const MAX_DATAGRAM: usize = 1536;

/// Re-subscription that keeps the console pushing updates.
#[derive(Debug, Clone)]
pub struct Keepalive {
    /// Control command (`ON`/`OFF`) consumed by the worker, never sent.
    pub control: String,
    /// Request enqueued on every tick.
    pub request: String,
    pub interval: Duration,
}

/// Behaviour of one OSC device.
#[derive(Debug, Clone)]
pub struct OscProfile {
    pub keepalive: Option<Keepalive>,
    /// Local address the per-message sockets bind to.
    pub bind_host: String,
    pub recv_timeout: Duration,
}

impl OscProfile {
    /// Behringer X32 and Midas M32.
    pub fn x32() -> Self {
        Self {
            keepalive: Some(Keepalive {
                control: "XRemote repeating".into(),
                request: "XRemote".into(),
                interval: Duration::from_millis(9900),
            }),
            ..Self::default()
        }
    }
}

impl Default for OscProfile {
    fn default() -> Self {
        Self {
            keepalive: None,
            bind_host: "0.0.0.0".into(),
            recv_timeout: Duration::from_millis(100),
        }
    }
}

/// OSC transport.
pub struct OscTransport {
    endpoint: Endpoint,
    profile: OscProfile,
    target: Option<SocketAddr>,
    socket: Option<UdpSocket>,
    last_composed: Option<CommandSendItem>,
    keepalive: Option<RepeatingTimer>,
    buf: Vec<u8>,
}

impl OscTransport {
    pub fn new(endpoint: Endpoint, profile: OscProfile) -> Self {
        Self {
            endpoint,
            profile,
            target: None,
            socket: None,
            last_composed: None,
            keepalive: None,
            buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    /// Local address of the socket waiting for replies.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn send_item(&mut self, ctx: &WorkerContext, item: CommandSendItem) -> Result<(), TransportError> {
        if let Some(keepalive) = self.profile.keepalive.clone()
            && item.command == keepalive.control
        {
            return self.toggle_keepalive(ctx, &keepalive, &item);
        }

        let composed = match ctx.templates.compose(&item) {
            Ok(c) => c,
            Err(e) => return ctx.answers.failed(&item, &e),
        };
        let packet = OscPacket::Message(OscMessage {
            addr: composed.message,
            args: composed.payload.iter().map(to_osc).collect(),
        });
        let bytes = match rosc::encoder::encode(&packet) {
            Ok(b) => b,
            Err(e) => return ctx.answers.failed(&item, &format!("{e:?}")),
        };
        let target = self.target.ok_or(TransportError::Disconnected)?;

        // Replacing the socket drops the previous reply port.
        let socket = UdpSocket::bind((self.profile.bind_host.as_str(), 0))?;
        socket.set_read_timeout(Some(self.profile.recv_timeout))?;
        socket.send_to(&bytes, target)?;
        debug!(device = %ctx.device, ?packet, local = ?socket.local_addr().ok(), "send");
        info!(device = %ctx.device, "~~> {item}");
        self.socket = Some(socket);
        self.last_composed = Some(item);
        Ok(())
    }

    fn toggle_keepalive(
        &mut self,
        ctx: &WorkerContext,
        keepalive: &Keepalive,
        item: &CommandSendItem,
    ) -> Result<(), TransportError> {
        let on = item
            .arguments
            .first()
            .and_then(Value::as_str)
            .is_some_and(|s| s.eq_ignore_ascii_case("ON"));
        if on {
            let request = CommandSendItem::request(ctx.device.clone(), keepalive.request.clone());
            if self.keepalive.is_none() {
                let tx = ctx.requeue.clone();
                let tick = request.clone();
                let device = ctx.device.clone();
                let mut inbox_open = true;
                let timer = RepeatingTimer::start(keepalive.interval, move || {
                    if tx.send(tick.clone()).is_err() && inbox_open {
                        inbox_open = false;
                        debug!(device = %device, "keepalive tick dropped, worker inbox closed");
                    }
                })?;
                debug!(device = %ctx.device, interval = ?timer.interval(), "keepalive started");
                self.keepalive = Some(timer);
            }
            if ctx.requeue.send(request).is_err() {
                debug!(device = %ctx.device, "keepalive request dropped, worker inbox closed");
            }
        } else if let Some(timer) = self.keepalive.take() {
            timer.cancel();
            debug!(device = %ctx.device, interval = ?timer.interval(), "keepalive stopped");
        }
        info!(device = %ctx.device, "{item} not sent, handled as control data");
        Ok(())
    }

    fn receive(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let n = match socket.recv_from(&mut self.buf) {
            Ok((n, _from)) => n,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        match rosc::decoder::decode_udp(&self.buf[..n]) {
            Ok((_, packet)) => {
                let mut messages = Vec::new();
                flatten(packet, &mut messages);
                for msg in messages {
                    self.analyze(ctx, msg)?;
                }
                Ok(())
            }
            Err(e) => {
                warn!(device = %ctx.device, "undecodable datagram: {e:?}");
                let raw = String::from_utf8_lossy(&self.buf[..n]).into_owned();
                ctx.answers.unidentifiable(vec![Value::Str(raw)])
            }
        }
    }

    fn analyze(&self, ctx: &WorkerContext, msg: OscMessage) -> Result<(), TransportError> {
        debug!(device = %ctx.device, "analyzing {} with args {:?}", msg.addr, msg.args);
        let extra: Vec<Value> = msg.args.into_iter().map(from_osc).collect();
        let addr = msg.addr;

        // Reply to the last message sent?
        if let Some(last) = &self.last_composed
            && let Some(template) = ctx.templates.get(&last.command)
        {
            match template.analyze(&addr, &extra) {
                Ok(Some(values)) => {
                    return ctx.answers.emit(
                        Some(&template.name),
                        AnswerValues::Mapped(values),
                        ComType::outcome(last.request, true),
                    );
                }
                Err(e) if template.matches(&addr) => {
                    warn!(device = %ctx.device, "error analyzing {addr}: {e}");
                    return ctx.answers.unidentifiable(raw(addr, extra));
                }
                _ => {}
            }
        }

        match ctx.templates.identify(&addr, &extra) {
            Some((template, Ok(values))) => ctx.answers.emit(
                Some(&template.name),
                AnswerValues::Mapped(values),
                ComType::MessageStatus,
            ),
            Some((_, Err(e))) => {
                warn!(device = %ctx.device, "error analyzing {addr}: {e}");
                ctx.answers.unidentifiable(raw(addr, extra))
            }
            None => ctx.answers.unidentifiable(raw(addr, extra)),
        }
    }
}

impl Transport for OscTransport {
    fn connect(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        let target = self.endpoint.resolve()?;
        debug!(device = %ctx.device, %target, "osc target resolved");
        self.target = Some(target);
        Ok(())
    }

    fn poll(&mut self, ctx: &WorkerContext) -> Result<(), TransportError> {
        if let Some(item) = ctx.try_next() {
            return self.send_item(ctx, item);
        }
        if self.socket.is_some() {
            return self.receive(ctx);
        }
        if let Some(item) = ctx.next_timeout(self.profile.recv_timeout) {
            self.send_item(ctx, item)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.socket = None;
        self.target = None;
        self.last_composed = None;
    }

    fn on_exit(&mut self) {
        self.keepalive = None;
    }
}

fn raw(addr: String, extra: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::with_capacity(extra.len() + 1);
    out.push(Value::Str(addr));
    out.extend(extra);
    out
}

fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(m) => out.push(m),
        OscPacket::Bundle(b) => {
            for p in b.content {
                flatten(p, out);
            }
        }
    }
}

/// Outgoing argument conversion. Integers that fit use the 32-bit type.
pub fn to_osc(value: &Value) -> OscType {
    match value {
        Value::Int(i) => match i32::try_from(*i) {
            Ok(small) => OscType::Int(small),
            Err(_) => OscType::Long(*i),
        },
        Value::Float(f) => OscType::Float(*f as f32),
        Value::Str(s) => OscType::String(s.clone()),
    }
}

/// Incoming argument conversion. Types without a scalar equivalent are
/// kept as their debug text.
pub fn from_osc(arg: OscType) -> Value {
    match arg {
        OscType::Int(i) => Value::Int(i64::from(i)),
        OscType::Long(i) => Value::Int(i),
        OscType::Float(f) => Value::Float(f64::from(f)),
        OscType::Double(f) => Value::Float(f),
        OscType::String(s) => Value::Str(s),
        OscType::Bool(b) => Value::Int(i64::from(b)),
        OscType::Char(c) => Value::Str(c.to_string()),
        other => Value::Str(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::template::TemplateSet;
    use crate::testing::{self, WarnCounter};

    const X32: &str = include_str!("../../templates/behringerx32.yaml");

    fn x32_set() -> TemplateSet {
        TemplateSet::from_yaml_str("behringerx32", X32, "behringerx32.yaml").unwrap()
    }

    /// Fake console on loopback. Returns its endpoint and socket.
    fn console() -> (Endpoint, UdpSocket) {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = sock.local_addr().unwrap().port();
        (Endpoint::new("127.0.0.1", port), sock)
    }

    fn loopback_profile() -> OscProfile {
        OscProfile { bind_host: "127.0.0.1".into(), recv_timeout: Duration::from_millis(10), ..OscProfile::x32() }
    }

    fn recv_message(sock: &UdpSocket) -> (OscMessage, SocketAddr) {
        let mut buf = [0u8; 1536];
        let (n, from) = sock.recv_from(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..n]).unwrap().1 {
            OscPacket::Message(m) => (m, from),
            OscPacket::Bundle(_) => panic!("unexpected bundle"),
        }
    }

    fn reply(sock: &UdpSocket, to: SocketAddr, addr: &str, args: Vec<OscType>) {
        let bytes = rosc::encoder::encode(&OscPacket::Message(OscMessage { addr: addr.into(), args })).unwrap();
        sock.send_to(&bytes, to).unwrap();
    }

    fn pump(t: &mut OscTransport, ctx: &WorkerContext, rounds: usize) {
        for _ in 0..rounds {
            t.poll(ctx).unwrap();
        }
    }

    #[test]
    fn command_with_payload_and_matching_reply() {
        let (endpoint, console) = console();
        let (ctx, rx) = testing::context("Behringer X32", x32_set());
        let mut t = OscTransport::new(endpoint, loopback_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue
            .send(CommandSendItem::command("Behringer X32", "Fader").with_args([Value::Int(5), Value::Float(0.75)]))
            .unwrap();
        pump(&mut t, &ctx, 1);

        let (msg, from) = recv_message(&console);
        assert_eq!(msg.addr, "/ch/05/mix/fader");
        assert_eq!(msg.args, vec![OscType::Float(0.75)]);
        assert_eq!(Some(from), t.local_addr());

        reply(&console, from, "/ch/05/mix/fader", vec![OscType::Float(0.75)]);
        pump(&mut t, &ctx, 5);
        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::CommandSuccess);
        assert_eq!(answers[0].values.get("channel"), Some(&Value::Int(5)));
        assert_eq!(answers[0].values.get("level"), Some(&Value::Float(0.75)));
    }

    #[test]
    fn other_address_is_status_and_unknown_is_unidentifiable() {
        let (endpoint, console) = console();
        let (ctx, rx) = testing::context("Behringer X32", x32_set());
        let mut t = OscTransport::new(endpoint, loopback_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue.send(CommandSendItem::request("Behringer X32", "Fader").with_args([3])).unwrap();
        pump(&mut t, &ctx, 1);
        let (msg, from) = recv_message(&console);
        assert!(msg.args.is_empty());

        reply(&console, from, "/ch/03/mix/on", vec![OscType::Int(0)]);
        reply(&console, from, "/bus/01/config/name", vec![OscType::String("Drums".into())]);
        pump(&mut t, &ctx, 6);

        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 2, "{answers:?}");
        assert_eq!(answers[0].command.as_deref(), Some("Mute"));
        assert_eq!(answers[0].message_type, ComType::MessageStatus);
        assert_eq!(answers[0].values.get("state"), Some(&Value::from("Muted")));
        assert_eq!(answers[1].message_type, ComType::Unidentifiable);
        assert_eq!(
            answers[1].values,
            AnswerValues::Raw(vec![Value::from("/bus/01/config/name"), Value::from("Drums")])
        );
    }

    #[test]
    fn composition_failure_sends_nothing() {
        let (endpoint, console) = console();
        console.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        let (ctx, rx) = testing::context("Behringer X32", x32_set());
        let mut t = OscTransport::new(endpoint, loopback_profile());
        t.connect(&ctx).unwrap();

        ctx.requeue
            .send(CommandSendItem::command("Behringer X32", "Mute").with_args([Value::Int(1), Value::from("Loud")]))
            .unwrap();
        pump(&mut t, &ctx, 1);

        let answers = testing::drain(&rx);
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].message_type, ComType::Failed);
        assert_eq!(answers[0].command.as_deref(), Some("Mute"));
        assert!(t.local_addr().is_none());
        let mut buf = [0u8; 64];
        assert!(console.recv_from(&mut buf).is_err());
    }

    #[test]
    fn keepalive_control_is_consumed_and_repeats() {
        let (endpoint, console) = console();
        let (ctx, rx) = testing::context("Behringer X32", x32_set());
        let mut profile = loopback_profile();
        if let Some(k) = profile.keepalive.as_mut() {
            k.interval = Duration::from_millis(30);
        }
        let mut t = OscTransport::new(endpoint, profile);
        t.connect(&ctx).unwrap();

        ctx.requeue
            .send(CommandSendItem::command("Behringer X32", "XRemote repeating").with_args(["ON"]))
            .unwrap();
        pump(&mut t, &ctx, 2);
        let (first, _) = recv_message(&console);
        assert_eq!(first.addr, "/xremote");

        std::thread::sleep(Duration::from_millis(50));
        pump(&mut t, &ctx, 3);
        let (second, _) = recv_message(&console);
        assert_eq!(second.addr, "/xremote");

        ctx.requeue
            .send(CommandSendItem::command("Behringer X32", "XRemote repeating").with_args(["OFF"]))
            .unwrap();
        // Ticks queued before OFF are still sent.
        for _ in 0..20 {
            if t.keepalive.is_none() {
                break;
            }
            t.poll(&ctx).unwrap();
        }
        assert!(t.keepalive.is_none());
        assert!(testing::drain(&rx).is_empty());
    }

    #[test]
    fn keepalive_tolerates_closed_inbox() {
        let (endpoint, _console) = console();
        let (mut ctx, rx) = testing::context("Behringer X32", x32_set());
        ctx.inbox = std::sync::mpsc::channel().1;
        let mut profile = loopback_profile();
        let Some(keepalive) = profile.keepalive.as_mut().map(|k| {
            k.interval = Duration::from_millis(10);
            k.clone()
        }) else {
            panic!("x32 profile has a keepalive");
        };
        let mut t = OscTransport::new(endpoint, profile);
        let on = CommandSendItem::command("Behringer X32", "XRemote repeating").with_args(["ON"]);
        let off = CommandSendItem::command("Behringer X32", "XRemote repeating").with_args(["OFF"]);

        let counter = WarnCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        tracing::subscriber::with_default(subscriber, || {
            t.toggle_keepalive(&ctx, &keepalive, &on).unwrap();
            assert!(t.keepalive.is_some());
            std::thread::sleep(Duration::from_millis(40));
            t.toggle_keepalive(&ctx, &keepalive, &off).unwrap();
        });

        assert!(t.keepalive.is_none());
        assert_eq!(counter.count(), 0);
        assert!(testing::drain(&rx).is_empty());
    }

    #[test]
    fn worker_thread_round_trip() {
        let (endpoint, console) = console();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = crate::worker::spawn(
            "Midas M32",
            Arc::new(x32_set()),
            Box::new(OscTransport::new(endpoint, loopback_profile())),
            tx,
            Duration::from_millis(50),
        )
        .unwrap();
        handle.sender().send(CommandSendItem::request("Midas M32", "Info")).unwrap();
        let (msg, from) = recv_message(&console);
        assert_eq!(msg.addr, "/info");
        reply(
            &console,
            from,
            "/info",
            ["V2.07", "osc-server", "M32", "4.06"].map(|s| OscType::String(s.into())).to_vec(),
        );
        let answer = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(answer.message_type, ComType::RequestSuccess);
        assert_eq!(answer.values.get("model"), Some(&Value::from("M32")));
        handle.signal_stop();
        assert!(handle.join().is_ok());
    }

    #[test]
    fn value_conversion() {
        assert_eq!(to_osc(&Value::Int(7)), OscType::Int(7));
        assert_eq!(to_osc(&Value::Int(1 << 40)), OscType::Long(1 << 40));
        assert_eq!(from_osc(OscType::Bool(true)), Value::Int(1));
        assert_eq!(from_osc(OscType::Double(0.5)), Value::Float(0.5));
    }
}
