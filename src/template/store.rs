//! Per-device template tables.
//!
//! A store file is a YAML list of template records:
//!
//! ```yaml
//! - !CommandTemplate          # optional tag, accepted and ignored
//!   name: Track Jump
//!   description: jump to track number
//!   command_composition: "Tr{:04d}"
//!   answer_analysis: 'ack\+@0Tr(\d{4})'
//!   argument_mappings:
//!     track: int
//! ```

use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result, TemplateError};
use crate::item::CommandSendItem;
use crate::value::Value;

use super::{CommandTemplate, Composed};

/// Ordered name → template table for one device.
#[derive(Debug, Clone, Default)]
pub struct TemplateSet {
    key: String,
    templates: IndexMap<String, CommandTemplate>,
}

/// A reply resolved by [`TemplateSet::identify`].
pub type Identified<'a> = (&'a CommandTemplate, Result<IndexMap<String, Value>>);

impl TemplateSet {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into(), templates: IndexMap::new() }
    }

    pub fn from_templates(
        key: impl Into<String>,
        templates: impl IntoIterator<Item = CommandTemplate>,
    ) -> Self {
        let mut set = Self::new(key);
        for t in templates {
            set.insert(t);
        }
        set
    }

    /// Load `path`. Unreadable or non-list files are errors; individual
    /// malformed records are logged and skipped.
    pub fn load(key: impl Into<String>, path: &Path) -> std::result::Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::read(path, e))?;
        Self::from_yaml_str(key, &text, &path.display().to_string())
    }

    /// Parse a store from YAML text. `origin` names the source in log lines.
    pub fn from_yaml_str(
        key: impl Into<String>,
        text: &str,
        origin: &str,
    ) -> std::result::Result<Self, ConfigError> {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| ConfigError::yaml(origin, e))?;
        let serde_yaml::Value::Sequence(records) = untag(doc) else {
            return Err(ConfigError::NotAList { path: origin.to_string() });
        };

        let mut set = Self::new(key);
        for (i, record) in records.into_iter().enumerate() {
            match serde_yaml::from_value::<CommandTemplate>(untag(record)) {
                Ok(t) => set.insert(t),
                Err(e) => warn!(store = %set.key, "skipping malformed template #{i} in {origin}: {e}"),
            }
        }
        debug!(store = %set.key, "loaded {} template(s) from {origin}", set.len());
        Ok(set)
    }

    /// Add or replace a template.
    pub fn insert(&mut self, template: CommandTemplate) {
        if let Some(old) = self.templates.insert(template.name.clone(), template) {
            warn!(store = %self.key, "template {:?} defined twice, keeping the later one", old.name);
        }
    }

    /// Identifying key, e.g. `denondn500bd`.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, name: &str) -> Option<&CommandTemplate> {
        self.templates.get(name)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandTemplate> {
        self.templates.values()
    }

    /// Validate every template; returns the total number of findings.
    pub fn validate(&self) -> usize {
        let errors: usize = self.iter().map(CommandTemplate::validate).sum();
        if errors > 0 {
            warn!(store = %self.key, "{errors} template error(s) in {} template(s)", self.len());
        } else {
            info!(store = %self.key, "{} template(s) valid", self.len());
        }
        errors
    }

    /// Compose `item` with the template it names.
    pub fn compose(&self, item: &CommandSendItem) -> Result<Composed> {
        self.get(&item.command)
            .ok_or_else(|| TemplateError::UnknownCommand { command: item.command.clone() })?
            .compose(item)
    }

    /// First template (in declaration order) whose reply expression matches.
    ///
    /// A matching template whose values fail to decode is still returned, with
    /// the error, so the caller can report the reply as unidentifiable.
    pub fn identify(&self, raw: &str, extra: &[Value]) -> Option<Identified<'_>> {
        self.iter().find_map(|t| match t.analyze(raw, extra) {
            Ok(Some(values)) => Some((t, Ok(values))),
            Ok(None) => None,
            Err(e) => t.matches(raw).then_some((t, Err(e))),
        })
    }
}

fn untag(mut v: serde_yaml::Value) -> serde_yaml::Value {
    while let serde_yaml::Value::Tagged(tagged) = v {
        v = tagged.value;
    }
    v
}
