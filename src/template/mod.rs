//! Declarative command templates.
//!
//! A [`CommandTemplate`] describes one operation of one device: how to build
//! the outgoing request/command from typed arguments and how to recognise and
//! decode the device's reply.
//!
//! Arguments are described by an ordered mapping of name → [`ArgumentKind`]:
//!
//! | YAML form                 | Kind                          | Outgoing           | Incoming               |
//! |---------------------------|-------------------------------|--------------------|------------------------|
//! | `int` / `float` / `str`   | [`ArgumentKind::Primitive`]   | cast               | cast                   |
//! | `[1, 2, 3]`               | [`ArgumentKind::DiscreteList`]| cast + membership  | cast                   |
//! | `{On: "ON", Off: "OFF"}`  | [`ArgumentKind::DiscreteMap`] | label → wire value | wire value → label     |

pub mod format;
pub mod store;

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, TemplateError};
use crate::item::{Arguments, CommandSendItem};
use crate::value::Value;

pub use format::Pattern;
pub use store::TemplateSet;

// ---------------------------------------------------------------------------
// Argument kinds
// ---------------------------------------------------------------------------

/// Primitive argument types accepted in mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveType {
    Int,
    Float,
    Str,
}

impl PrimitiveType {
    pub fn name(self) -> &'static str {
        match self {
            PrimitiveType::Int => "int",
            PrimitiveType::Float => "float",
            PrimitiveType::Str => "str",
        }
    }

    fn of(value: &Value) -> Self {
        match value {
            Value::Int(_) => PrimitiveType::Int,
            Value::Float(_) => PrimitiveType::Float,
            Value::Str(_) => PrimitiveType::Str,
        }
    }

    /// Cast `value` to this type. `None` if it cannot be represented.
    pub fn cast(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (PrimitiveType::Int, Value::Int(i)) => Some(Value::Int(*i)),
            (PrimitiveType::Int, Value::Float(f)) if f.is_finite() => Some(Value::Int(f.trunc() as i64)),
            (PrimitiveType::Int, Value::Float(_)) => None,
            (PrimitiveType::Int, Value::Str(s)) => s.trim().parse().ok().map(Value::Int),
            (PrimitiveType::Float, Value::Str(s)) => s.trim().parse().ok().map(Value::Float),
            (PrimitiveType::Float, v) => v.as_float().map(Value::Float),
            (PrimitiveType::Str, Value::Str(s)) => Some(Value::Str(s.clone())),
            (PrimitiveType::Str, v) => Some(Value::Str(v.to_string())),
        }
    }
}

impl FromStr for PrimitiveType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "int" => Ok(PrimitiveType::Int),
            "float" => Ok(PrimitiveType::Float),
            "str" => Ok(PrimitiveType::Str),
            other => Err(format!("unknown argument type {other:?}, expected int, float or str")),
        }
    }
}

/// How one argument is validated and translated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawKind")]
pub enum ArgumentKind {
    Primitive(PrimitiveType),
    /// Only these wire values are legal.
    DiscreteList(Vec<Value>),
    /// Human label → wire value.
    DiscreteMap(IndexMap<String, Value>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawKind {
    TypeName(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl TryFrom<RawKind> for ArgumentKind {
    type Error = String;

    fn try_from(raw: RawKind) -> std::result::Result<Self, Self::Error> {
        match raw {
            RawKind::TypeName(name) => name.parse().map(ArgumentKind::Primitive),
            RawKind::List(values) if values.is_empty() => Err("empty value list".into()),
            RawKind::List(values) => Ok(ArgumentKind::DiscreteList(values)),
            RawKind::Map(map) if map.is_empty() => Err("empty value mapping".into()),
            RawKind::Map(map) => Ok(ArgumentKind::DiscreteMap(map)),
        }
    }
}

impl ArgumentKind {
    /// Type wire values of this argument are cast to.
    pub fn wire_type(&self) -> PrimitiveType {
        match self {
            ArgumentKind::Primitive(t) => *t,
            ArgumentKind::DiscreteList(values) => {
                values.first().map_or(PrimitiveType::Str, PrimitiveType::of)
            }
            ArgumentKind::DiscreteMap(map) => {
                map.values().next().map_or(PrimitiveType::Str, PrimitiveType::of)
            }
        }
    }

    /// All discrete values share one type.
    pub fn is_homogeneous(&self) -> bool {
        let mut values: Box<dyn Iterator<Item = &Value>> = match self {
            ArgumentKind::Primitive(_) => return true,
            ArgumentKind::DiscreteList(v) => Box::new(v.iter()),
            ArgumentKind::DiscreteMap(m) => Box::new(m.values()),
        };
        match values.next() {
            Some(first) => values.all(|v| v.same_type(first)),
            None => true,
        }
    }

    /// Translate a caller-supplied value into its wire value.
    pub fn to_wire(&self, argument: &str, value: &Value) -> Result<Value> {
        let illegal = || TemplateError::IllegalValue {
            argument: argument.to_string(),
            value: value.clone(),
        };
        match self {
            ArgumentKind::Primitive(t) => t.cast(value).ok_or_else(|| TemplateError::Cast {
                argument: argument.to_string(),
                value: value.clone(),
                target: t.name(),
            }),
            ArgumentKind::DiscreteList(legal) => {
                let v = self.wire_type().cast(value).ok_or_else(illegal)?;
                if legal.contains(&v) { Ok(v) } else { Err(illegal()) }
            }
            ArgumentKind::DiscreteMap(map) => {
                if let Some(wire) = value.as_str().and_then(|label| map.get(label)) {
                    return Ok(wire.clone());
                }
                let v = self.wire_type().cast(value).ok_or_else(illegal)?;
                if map.values().any(|w| *w == v) { Ok(v) } else { Err(illegal()) }
            }
        }
    }

    /// Translate a received wire value back into its caller-facing form.
    pub fn from_wire(&self, argument: &str, raw: &Value) -> Result<Value> {
        let target = self.wire_type();
        let v = target.cast(raw).ok_or_else(|| TemplateError::Cast {
            argument: argument.to_string(),
            value: raw.clone(),
            target: target.name(),
        })?;
        match self {
            ArgumentKind::DiscreteMap(map) => Ok(map
                .iter()
                .find(|(_, wire)| **wire == v)
                .map(|(label, _)| Value::Str(label.clone()))
                .unwrap_or(v)),
            _ => Ok(v),
        }
    }
}

// ---------------------------------------------------------------------------
// Command template
// ---------------------------------------------------------------------------

/// Output of [`CommandTemplate::compose`].
#[derive(Debug, Clone, PartialEq)]
pub struct Composed {
    /// Rendered pattern: the full line for text protocols, the address for OSC.
    pub message: String,
    /// Arguments not consumed by pattern slots (OSC message arguments).
    pub payload: Vec<Value>,
}

/// One operation of one device. Immutable after loading.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "TemplateRecord")]
pub struct CommandTemplate {
    pub name: String,
    pub description: String,
    pub request_composition: Option<String>,
    pub command_composition: Option<String>,
    pub answer_analysis: Option<String>,
    pub argument_mappings: IndexMap<String, ArgumentKind>,
    analysis: Option<Regex>,
}

#[derive(Deserialize)]
struct TemplateRecord {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "request_object")]
    request_composition: Option<String>,
    #[serde(default)]
    command_composition: Option<String>,
    #[serde(default)]
    answer_analysis: Option<String>,
    #[serde(default)]
    argument_mappings: Option<IndexMap<String, ArgumentKind>>,
}

impl From<TemplateRecord> for CommandTemplate {
    fn from(r: TemplateRecord) -> Self {
        let mut t = CommandTemplate::new(r.name);
        t.description = r.description;
        t.request_composition = r.request_composition.filter(|s| !s.is_empty());
        t.command_composition = r.command_composition.filter(|s| !s.is_empty());
        t.argument_mappings = r.argument_mappings.unwrap_or_default();
        match r.answer_analysis.filter(|s| !s.is_empty()) {
            Some(expr) => t.with_analysis(expr),
            None => t,
        }
    }
}

/// One finding of [`CommandTemplate::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub attribute: &'static str,
    pub message: String,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<19}: {}", self.attribute, self.message)
    }
}

impl CommandTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            request_composition: None,
            command_composition: None,
            answer_analysis: None,
            argument_mappings: IndexMap::new(),
            analysis: None,
        }
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn with_request(mut self, pattern: impl Into<String>) -> Self {
        self.request_composition = Some(pattern.into());
        self
    }

    pub fn with_command(mut self, pattern: impl Into<String>) -> Self {
        self.command_composition = Some(pattern.into());
        self
    }

    /// Set the reply expression. An expression that does not compile is kept
    /// for [`validate`](Self::validate) to report, and never matches.
    pub fn with_analysis(mut self, expr: impl Into<String>) -> Self {
        let expr = expr.into();
        self.analysis = Regex::new(&expr).ok();
        self.answer_analysis = Some(expr);
        self
    }

    pub fn with_argument(mut self, name: impl Into<String>, kind: ArgumentKind) -> Self {
        self.argument_mappings.insert(name.into(), kind);
        self
    }

    /// Declared argument names, in order.
    pub fn arguments(&self) -> impl Iterator<Item = &str> {
        self.argument_mappings.keys().map(String::as_str)
    }

    /// Build the outgoing message for `item`.
    ///
    /// Arguments are reordered (if named), cast per mapping, and rendered into
    /// the request or command pattern. Arguments beyond the pattern's slot
    /// count are returned as [`Composed::payload`].
    pub fn compose(&self, item: &CommandSendItem) -> Result<Composed> {
        let (kind, source) = if item.request {
            ("request", &self.request_composition)
        } else {
            ("command", &self.command_composition)
        };
        let source = source.as_deref().ok_or_else(|| TemplateError::MissingComposition {
            template: self.name.clone(),
            kind,
        })?;
        let pattern = Pattern::parse(source)?;

        let args = self.ordered_arguments(&item.arguments)?;
        if args.len() > self.argument_mappings.len() {
            return Err(TemplateError::Arity {
                template: self.name.clone(),
                declared: self.argument_mappings.len(),
                supplied: args.len(),
            });
        }
        let wire = self
            .argument_mappings
            .iter()
            .zip(&args)
            .map(|((name, kind), value)| kind.to_wire(name, value))
            .collect::<Result<Vec<_>>>()?;

        if wire.len() < pattern.slots() {
            return Err(TemplateError::TooFewArguments {
                template: self.name.clone(),
                slots: pattern.slots(),
                supplied: wire.len(),
            });
        }
        let (head, tail) = wire.split_at(pattern.slots());
        let message = pattern.render(head)?;
        debug!(template = %self.name, %message, "composed");
        Ok(Composed { message, payload: tail.to_vec() })
    }

    fn ordered_arguments(&self, arguments: &Arguments) -> Result<Vec<Value>> {
        match arguments {
            Arguments::Positional(v) => Ok(v.clone()),
            Arguments::Named(map) => {
                if let Some(unknown) = map.keys().find(|k| !self.argument_mappings.contains_key(*k)) {
                    return Err(TemplateError::UnknownArgument {
                        template: self.name.clone(),
                        argument: unknown.clone(),
                    });
                }
                // Trailing arguments may be left out; gaps may not.
                let mut out = Vec::with_capacity(map.len());
                let mut gap: Option<&str> = None;
                for key in self.argument_mappings.keys() {
                    match (map.get(key), gap) {
                        (Some(_), Some(missing)) => {
                            return Err(TemplateError::MissingArgument {
                                argument: missing.to_string(),
                            });
                        }
                        (Some(v), None) => out.push(v.clone()),
                        (None, None) => gap = Some(key.as_str()),
                        (None, Some(_)) => {}
                    }
                }
                Ok(out)
            }
        }
    }

    /// True if the reply expression matches `raw`.
    pub fn matches(&self, raw: &str) -> bool {
        self.analysis.as_ref().is_some_and(|re| re.is_match(raw))
    }

    /// Decode `raw` with the reply expression.
    ///
    /// Capture groups, followed by `extra` values supplied by the transport
    /// (OSC arguments), are zipped against the argument mappings and cast
    /// back. Returns `Ok(None)` if there is no expression or it does not match;
    /// an empty mapping if it matches without capture groups.
    pub fn analyze(&self, raw: &str, extra: &[Value]) -> Result<Option<IndexMap<String, Value>>> {
        let Some(re) = &self.analysis else {
            return match self.answer_analysis {
                Some(_) => Err(TemplateError::BrokenAnalysis { template: self.name.clone() }),
                None => Ok(None),
            };
        };
        let Some(caps) = re.captures(raw) else {
            return Ok(None);
        };

        let captured = caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| Value::Str(m.as_str().to_string())));
        let values: Vec<Option<Value>> = captured.chain(extra.iter().cloned().map(Some)).collect();
        if values.len() > self.argument_mappings.len() {
            debug!(
                template = %self.name,
                "{} value(s) for {} mapping(s), extra ignored",
                values.len(),
                self.argument_mappings.len()
            );
        }

        let mut out = IndexMap::new();
        for ((name, kind), value) in self.argument_mappings.iter().zip(values) {
            // Optional groups that did not participate are left out.
            if let Some(v) = value {
                out.insert(name.clone(), kind.from_wire(name, &v)?);
            }
        }
        Ok(Some(out))
    }

    /// Static self-check. Every finding is logged; returns the number found.
    ///
    /// A template with findings stays usable for whatever still works.
    pub fn validate(&self) -> usize {
        let problems = self.problems();
        for p in &problems {
            warn!(template = %self.name, "template error: {p}");
        }
        if problems.is_empty() {
            debug!(template = %self.name, "template is valid");
        }
        problems.len()
    }

    /// Collect validation findings without logging.
    pub fn problems(&self) -> Vec<Problem> {
        let mut out = Vec::new();
        let mut report = |attribute, message: String| out.push(Problem { attribute, message });
        let mappings = self.argument_mappings.len();

        if self.name.trim().is_empty() {
            report("name", "name must not be empty".into());
        }

        for (name, kind) in &self.argument_mappings {
            if !kind.is_homogeneous() {
                report(
                    "argument_mappings",
                    format!("all values of {name:?} must have the same type"),
                );
            }
        }

        for (attribute, source) in [
            ("request_composition", &self.request_composition),
            ("command_composition", &self.command_composition),
        ] {
            let Some(source) = source else { continue };
            match Pattern::parse(source) {
                Ok(p) if p.slots() > mappings => report(
                    attribute,
                    format!("{} formatter slot(s) but {mappings} argument(s)", p.slots()),
                ),
                Ok(_) => {}
                Err(e) => report(attribute, format!("formatter error: {e}")),
            }
        }

        if let Some(expr) = &self.answer_analysis {
            match Regex::new(expr) {
                Ok(re) => {
                    let groups = re.captures_len() - 1;
                    if mappings == 0 && groups > 0 {
                        report(
                            "answer_analysis",
                            format!("{groups} capture group(s) but no argument mapping to decode into"),
                        );
                    } else if groups > mappings {
                        report(
                            "answer_analysis",
                            format!("{groups} capture group(s) but {mappings} argument(s)"),
                        );
                    }
                }
                Err(e) => report("answer_analysis", format!("regex error: {e}")),
            }
        }
        out
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
