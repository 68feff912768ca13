//! Supported devices.
//!
//! The [`Registry`] maps a device name to its transport kind, category,
//! template store and a constructor for its transport. Entries are added
//! explicitly; [`Registry::builtin`] holds the devices this crate ships.
//!
//! | Device | Transport | Default port |
//! |---|---|---|
//! | Denon DN-500BD | TCP line protocol | 9030 |
//! | Atlona AT-OME-SW32 | Telnet | 23 |
//! | Behringer X32 | OSC | 10023 |
//! | Midas M32 | OSC | 10023 |

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::conn::{Endpoint, TcpConnector};
use crate::error::{ConfigError, TransportError};
use crate::template::TemplateSet;
use crate::worker::{
    LineProfile, OscProfile, OscTransport, TcpTransport, TelnetProfile, TelnetTransport, Transport,
};

/// What a device is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Audio,
    Video,
    Light,
    Other,
    Undefined,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::Audio => "audio",
            Category::Video => "video",
            Category::Light => "light",
            Category::Other => "other",
            Category::Undefined => "undefined",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Telnet,
    Osc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Telnet => "telnet",
            TransportKind::Osc => "osc",
        })
    }
}

/// Where a device's templates come from when no override file exists.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// YAML text compiled into the crate.
    Embedded(&'static str),
    /// An already built set.
    Set(Arc<TemplateSet>),
}

pub const DENON_TEMPLATES: &str = include_str!("../templates/denondn500bd.yaml");
pub const ATLONA_TEMPLATES: &str = include_str!("../templates/atlonaatomesw32.yaml");
pub const X32_TEMPLATES: &str = include_str!("../templates/behringerx32.yaml");

/// Builds the transport for one endpoint.
pub type Constructor =
    Arc<dyn Fn(&Endpoint) -> Result<Box<dyn Transport>, TransportError> + Send + Sync>;

/// One registry entry.
#[derive(Clone)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: TransportKind,
    pub category: Category,
    /// File stem of the template store, e.g. `denondn500bd`.
    pub template_key: String,
    pub templates: TemplateSource,
    pub constructor: Constructor,
}

impl fmt::Debug for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("category", &self.category)
            .field("template_key", &self.template_key)
            .finish_non_exhaustive()
    }
}

impl DeviceSpec {
    pub fn new(
        name: impl Into<String>,
        kind: TransportKind,
        category: Category,
        template_key: impl Into<String>,
        templates: TemplateSource,
        constructor: Constructor,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            category,
            template_key: template_key.into(),
            templates,
            constructor,
        }
    }

    /// Load the template set: `<dir>/<template_key>.yaml` if it exists,
    /// the built-in store otherwise. The set is validated once here.
    pub fn templates(&self, template_dir: Option<&Path>) -> Result<Arc<TemplateSet>, ConfigError> {
        let set = match template_dir.map(|d| d.join(format!("{}.yaml", self.template_key))) {
            Some(path) if path.is_file() => {
                info!(device = %self.name, path = %path.display(), "loading templates");
                Arc::new(TemplateSet::load(self.template_key.clone(), &path)?)
            }
            _ => match &self.templates {
                TemplateSource::Embedded(text) => Arc::new(TemplateSet::from_yaml_str(
                    self.template_key.clone(),
                    text,
                    &format!("built-in {}.yaml", self.template_key),
                )?),
                TemplateSource::Set(set) => set.clone(),
            },
        };
        let problems = set.validate();
        debug!(device = %self.name, templates = set.len(), problems, "templates ready");
        Ok(set)
    }

    pub fn transport(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>, TransportError> {
        (self.constructor)(endpoint)
    }
}

/// Device name → [`DeviceSpec`], in registration order.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: IndexMap<String, DeviceSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every device this crate supports out of the box.
    pub fn builtin() -> Self {
        let mut reg = Self::new();
        reg.register(DeviceSpec::new(
            "Denon DN-500BD",
            TransportKind::Tcp,
            Category::Video,
            "denondn500bd",
            TemplateSource::Embedded(DENON_TEMPLATES),
            Arc::new(|endpoint: &Endpoint| -> Result<Box<dyn Transport>, TransportError> {
                Ok(Box::new(TcpTransport::new(
                    endpoint.clone(),
                    Box::new(TcpConnector::default()),
                    LineProfile::denon()?,
                )))
            }),
        ));
        reg.register(DeviceSpec::new(
            "Atlona AT-OME-SW32",
            TransportKind::Telnet,
            Category::Video,
            "atlonaatomesw32",
            TemplateSource::Embedded(ATLONA_TEMPLATES),
            Arc::new(|endpoint: &Endpoint| -> Result<Box<dyn Transport>, TransportError> {
                Ok(Box::new(TelnetTransport::new(
                    endpoint.clone(),
                    Box::new(TcpConnector::default()),
                    TelnetProfile::atlona()?,
                )))
            }),
        ));
        for (name, key) in [("Behringer X32", "behringerx32"), ("Midas M32", "midasm32")] {
            reg.register(DeviceSpec::new(
                name,
                TransportKind::Osc,
                Category::Audio,
                key,
                TemplateSource::Embedded(X32_TEMPLATES),
                Arc::new(|endpoint: &Endpoint| -> Result<Box<dyn Transport>, TransportError> {
                    Ok(Box::new(OscTransport::new(endpoint.clone(), OscProfile::x32())))
                }),
            ));
        }
        reg
    }

    /// Add or replace an entry.
    pub fn register(&mut self, spec: DeviceSpec) {
        if let Some(old) = self.devices.insert(spec.name.clone(), spec) {
            debug!(device = %old.name, "registry entry replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<&DeviceSpec> {
        self.devices.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceSpec> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::item::CommandSendItem;
    use crate::value::Value;

    #[test]
    fn builtin_devices() {
        let reg = Registry::builtin();
        assert_eq!(
            reg.names().collect::<Vec<_>>(),
            ["Denon DN-500BD", "Atlona AT-OME-SW32", "Behringer X32", "Midas M32"]
        );
        let m32 = reg.get("Midas M32").unwrap();
        assert_eq!(m32.kind, TransportKind::Osc);
        assert_eq!(m32.category, Category::Audio);
        assert_eq!(reg.get("Denon DN-500BD").unwrap().category.to_string(), "video");
    }

    #[test]
    fn builtin_stores_load_without_problems() {
        for spec in Registry::builtin().iter() {
            let set = spec.templates(None).unwrap();
            assert!(!set.is_empty(), "{}", spec.name);
            assert_eq!(set.validate(), 0, "{}", spec.name);
            assert_eq!(set.key(), spec.template_key);
        }
    }

    #[test]
    fn builtin_constructors() {
        let reg = Registry::builtin();
        for spec in reg.iter() {
            assert!(spec.transport(&Endpoint::new("127.0.0.1", 1)).is_ok(), "{}", spec.name);
        }
    }

    #[test]
    fn template_dir_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("denondn500bd.yaml"),
            "- !CommandTemplate\n  name: Eject\n  command_composition: \"2350\"\n",
        )
        .unwrap();
        let spec = Registry::builtin().get("Denon DN-500BD").cloned().unwrap();

        let set = spec.templates(Some(dir.path())).unwrap();
        assert_eq!(set.len(), 1);
        let composed = set.compose(&CommandSendItem::command("Denon DN-500BD", "Eject")).unwrap();
        assert_eq!(composed.message, "2350");

        // No file for this key: built-in store.
        let atlona = Registry::builtin().get("Atlona AT-OME-SW32").cloned().unwrap();
        let set = atlona.templates(Some(dir.path())).unwrap();
        assert!(set.get("Set Output").is_some());
    }

    #[test]
    fn builtin_denon_track_jump() {
        let spec = Registry::builtin().get("Denon DN-500BD").cloned().unwrap();
        let set = spec.templates(None).unwrap();
        let item = CommandSendItem::command("Denon DN-500BD", "Track Jump").with_args([Value::Int(7)]);
        assert_eq!(set.compose(&item).unwrap().message, "Tr0007");
    }
}
