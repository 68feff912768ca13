//! Template-driven remote control of AV devices.
//!
//! Commands are composed from per-device [`CommandTemplate`]s, sent by one
//! worker thread per device over TCP, Telnet or OSC, and every reply comes
//! back as a classified [`CommandAnswerItem`] on one shared queue.

pub mod bridge;
pub mod config;
pub mod conn;
pub mod devices;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod item;
pub mod logging;
pub mod signal;
pub mod template;
pub mod timer;
pub mod value;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::ControlLink;
pub use config::BridgeConfig;
pub use conn::Endpoint;
pub use devices::{Category, DeviceSpec, Registry, TransportKind};
pub use dispatch::{DispatchConfig, Dispatcher, Submitted};
pub use error::{ErrorKind, TemplateError, TransportError};
pub use item::{
    AnswerValues, Arguments, ComType, CommandAnswerItem, CommandSendItem, ControlToken, Submission,
};
pub use template::{ArgumentKind, CommandTemplate, PrimitiveType, TemplateSet};
pub use value::Value;
