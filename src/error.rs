use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::value::Value;

/// Errors from parsing or rendering a composition pattern.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("unmatched '{brace}' at offset {offset}")]
    UnbalancedBrace { brace: char, offset: usize },

    #[error("cannot switch between automatic and manual field numbering")]
    MixedNumbering,

    #[error("unsupported field name {name:?} (only positional fields are allowed)")]
    FieldName { name: String },

    #[error("invalid format spec {spec:?}")]
    InvalidSpec { spec: String },

    #[error("pattern needs argument {index} but only {supplied} supplied")]
    MissingArgument { index: usize, supplied: usize },

    #[error("format code '{code}' does not apply to {value:?}")]
    SpecMismatch { code: char, value: Value },
}

/// Errors from composing an outgoing message or decoding a reply with a template.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    #[error("no template named {command:?}")]
    UnknownCommand { command: String },

    #[error("template {template:?} has no {kind} composition")]
    MissingComposition { template: String, kind: &'static str },

    #[error("template {template:?} declares {declared} argument(s), got {supplied}")]
    Arity {
        template: String,
        declared: usize,
        supplied: usize,
    },

    #[error("pattern of {template:?} needs {slots} argument(s), got {supplied}")]
    TooFewArguments {
        template: String,
        slots: usize,
        supplied: usize,
    },

    #[error("argument {argument:?} is missing")]
    MissingArgument { argument: String },

    #[error("template {template:?} has no argument named {argument:?}")]
    UnknownArgument { template: String, argument: String },

    #[error("{value:?} is not a legal value for argument {argument:?}")]
    IllegalValue { argument: String, value: Value },

    #[error("cannot cast {value:?} to {target} for argument {argument:?}")]
    Cast {
        argument: String,
        value: Value,
        target: &'static str,
    },

    #[error("answer analysis of {template:?} is not a valid expression")]
    BrokenAnalysis { template: String },

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Whether a transport failure is worth another connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network trouble: reconnect after the retry interval.
    Recoverable,
    /// Logic or setup error: the worker stops.
    Fatal,
}

/// Errors raised inside a transport worker.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by device")]
    Disconnected,

    #[error("no address found for {endpoint}")]
    Resolve { endpoint: String },

    #[error("login not completed within {timeout:?}")]
    Login { timeout: Duration },

    #[error("answer channel closed")]
    AnswerChannelClosed,

    #[error("invalid device profile: {0}")]
    Profile(#[from] regex::Error),

    #[error("worker fault: {0}")]
    Fault(String),
}

impl TransportError {
    /// Classify this error for the reconnect loop.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Disconnected | Self::Resolve { .. } | Self::Login { .. } => {
                ErrorKind::Recoverable
            }
            Self::AnswerChannelClosed | Self::Profile(_) | Self::Fault(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// OS error code, if any, for log lines.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Errors loading configuration or template files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("template store {path} must be a list of templates")]
    NotAList { path: String },
}

impl ConfigError {
    pub(crate) fn read(path: &std::path::Path, source: io::Error) -> Self {
        Self::Read { path: path.display().to_string(), source }
    }

    pub(crate) fn yaml(path: impl Into<String>, source: serde_yaml::Error) -> Self {
        Self::Yaml { path: path.into(), source }
    }
}

/// Errors crossing the thread/process boundary.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid JSON line: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control link is closed")]
    Closed,

    #[error("bridge process {0}")]
    Exited(std::process::ExitStatus),
}

pub type Result<T> = std::result::Result<T, TemplateError>;
