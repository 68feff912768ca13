//! Value objects exchanged with the rest of the application.
//!
//! - [`CommandSendItem`] — one request (read) or command (write) for a device
//! - [`CommandAnswerItem`] — one classified reply from a device
//! - [`Submission`] — what callers enqueue: an item or a [`ControlToken`]

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Arguments of a [`CommandSendItem`].
///
/// Named arguments are reordered into the template's declared order before
/// composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arguments {
    Positional(Vec<Value>),
    Named(IndexMap<String, Value>),
}

impl Arguments {
    pub fn len(&self) -> usize {
        match self {
            Arguments::Positional(v) => v.len(),
            Arguments::Named(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First positional argument (or first named value), if any.
    pub fn first(&self) -> Option<&Value> {
        match self {
            Arguments::Positional(v) => v.first(),
            Arguments::Named(m) => m.values().next(),
        }
    }
}

impl Default for Arguments {
    fn default() -> Self {
        Arguments::Positional(Vec::new())
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arguments::Positional(v) => {
                write!(f, "(")?;
                for (i, a) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Arguments::Named(m) => write_map(f, m),
        }
    }
}

fn write_map(f: &mut fmt::Formatter<'_>, m: &IndexMap<String, Value>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, (k, v)) in m.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{k}: {v}")?;
    }
    write!(f, "}}")
}

/// A request or command addressed to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSendItem {
    /// Registry name of the target device, e.g. `"Denon DN-500BD"`.
    pub device: String,
    /// Template name within the device's template set.
    pub command: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// `true` selects the template's request composition, `false` the command composition.
    #[serde(default = "default_request")]
    pub request: bool,
    /// Delay before the dispatcher hands the item to its worker.
    #[serde(default, with = "secs_f64")]
    pub delay: Duration,
}

fn default_request() -> bool {
    true
}

impl CommandSendItem {
    /// A read-type item.
    pub fn request(device: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            command: command.into(),
            arguments: Arguments::default(),
            request: true,
            delay: Duration::ZERO,
        }
    }

    /// A write/action-type item.
    pub fn command(device: impl Into<String>, command: impl Into<String>) -> Self {
        Self { request: false, ..Self::request(device, command) }
    }

    pub fn with_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.arguments = Arguments::Positional(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_named<I, K, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.arguments =
            Arguments::Named(args.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl fmt::Display for CommandSendItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} {}; request:{}",
            self.device, self.command, self.arguments, self.request
        )
    }
}

/// Classification of a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComType {
    Unidentifiable,
    /// Success without template context.
    Success,
    /// Failure without template context.
    Failed,
    CommandSuccess,
    CommandFailed,
    RequestSuccess,
    RequestFailed,
    /// Unsolicited status push.
    MessageStatus,
}

impl ComType {
    /// Pick the read/write specific outcome.
    pub fn outcome(request: bool, ok: bool) -> Self {
        match (request, ok) {
            (true, true) => ComType::RequestSuccess,
            (true, false) => ComType::RequestFailed,
            (false, true) => ComType::CommandSuccess,
            (false, false) => ComType::CommandFailed,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ComType::Failed | ComType::CommandFailed | ComType::RequestFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComType::Unidentifiable => "unidentifiable",
            ComType::Success => "success",
            ComType::Failed => "failed",
            ComType::CommandSuccess => "command_success",
            ComType::CommandFailed => "command_failed",
            ComType::RequestSuccess => "request_success",
            ComType::RequestFailed => "request_failed",
            ComType::MessageStatus => "message_status",
        }
    }
}

impl fmt::Display for ComType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values decoded from a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValues {
    /// Argument name → value, when a template resolved the reply.
    Mapped(IndexMap<String, Value>),
    /// Raw payload, when it could not be resolved.
    Raw(Vec<Value>),
}

impl AnswerValues {
    pub fn empty() -> Self {
        AnswerValues::Mapped(IndexMap::new())
    }

    pub fn raw(text: impl Into<String>) -> Self {
        AnswerValues::Raw(vec![Value::Str(text.into())])
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            AnswerValues::Mapped(m) => m.get(key),
            AnswerValues::Raw(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AnswerValues::Mapped(m) => m.is_empty(),
            AnswerValues::Raw(v) => v.is_empty(),
        }
    }
}

impl fmt::Display for AnswerValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValues::Mapped(m) => write_map(f, m),
            AnswerValues::Raw(v) => {
                write!(f, "[")?;
                for (i, a) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a:?}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// A classified reply from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAnswerItem {
    pub device: String,
    /// Resolved template name, `None` if the reply could not be mapped.
    pub command: Option<String>,
    pub values: AnswerValues,
    pub message_type: ComType,
}

impl CommandAnswerItem {
    pub fn new(
        device: impl Into<String>,
        command: Option<String>,
        values: AnswerValues,
        message_type: ComType,
    ) -> Self {
        Self { device: device.into(), command, values, message_type }
    }

    /// An unresolved reply carrying the raw text.
    pub fn unidentifiable(device: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(device, None, AnswerValues::raw(raw), ComType::Unidentifiable)
    }
}

impl fmt::Display for CommandAnswerItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <- {} {}; {}",
            self.device,
            self.command.as_deref().unwrap_or("?"),
            self.values,
            self.message_type
        )
    }
}

/// Meta-commands acting on delayed sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlToken {
    Pause,
    Resume,
    Next,
}

impl FromStr for ControlToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pause" => Ok(ControlToken::Pause),
            "resume" => Ok(ControlToken::Resume),
            "next" => Ok(ControlToken::Next),
            other => Err(format!("unknown control token {other:?}")),
        }
    }
}

/// Anything a caller can hand to the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Submission {
    Control(ControlToken),
    Send(CommandSendItem),
}

impl From<CommandSendItem> for Submission {
    fn from(item: CommandSendItem) -> Self {
        Submission::Send(item)
    }
}

impl From<ControlToken> for Submission {
    fn from(token: ControlToken) -> Self {
        Submission::Control(token)
    }
}

mod secs_f64 {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_table() {
        assert_eq!(ComType::outcome(true, true), ComType::RequestSuccess);
        assert_eq!(ComType::outcome(true, false), ComType::RequestFailed);
        assert_eq!(ComType::outcome(false, true), ComType::CommandSuccess);
        assert_eq!(ComType::outcome(false, false), ComType::CommandFailed);
        assert!(ComType::CommandFailed.is_failure());
        assert!(!ComType::MessageStatus.is_failure());
    }

    #[test]
    fn submission_from_json() {
        let s: Submission = serde_json::from_str(r#""pause""#).unwrap();
        assert_eq!(s, Submission::Control(ControlToken::Pause));

        let s: Submission = serde_json::from_str(
            r#"{"device":"Atlona AT-OME-SW32","command":"Set Output","arguments":[2,1],"request":false,"delay":1.5}"#,
        )
        .unwrap();
        let Submission::Send(item) = s else { panic!("expected item") };
        assert_eq!(item.arguments, Arguments::Positional(vec![Value::Int(2), Value::Int(1)]));
        assert!(!item.request);
        assert_eq!(item.delay, Duration::from_millis(1500));
    }

    #[test]
    fn send_item_defaults_to_request() {
        let item: CommandSendItem =
            serde_json::from_str(r#"{"device":"Denon DN-500BD","command":"Status"}"#).unwrap();
        assert!(item.request);
        assert!(item.arguments.is_empty());
        assert_eq!(item.delay, Duration::ZERO);
    }

    #[test]
    fn answer_display() {
        let a = CommandAnswerItem::new(
            "Denon",
            Some("Play".into()),
            AnswerValues::empty(),
            ComType::CommandSuccess,
        );
        assert_eq!(a.to_string(), "Denon <- Play {}; command_success");
        let b = CommandAnswerItem::unidentifiable("Denon", "@0XX");
        assert_eq!(b.to_string(), "Denon <- ? [Str(\"@0XX\")]; unidentifiable");
    }

    #[test]
    fn control_token_parse() {
        assert_eq!("resume".parse::<ControlToken>(), Ok(ControlToken::Resume));
        assert!("stop".parse::<ControlToken>().is_err());
    }
}
