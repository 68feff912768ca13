//! Composition patterns in `str.format` style.
//!
//! Supported syntax:
//! ```text
//! literal {} {0} {1:04d} {:>8s} {:.2f} {{escaped}}
//! ```
//! Fields are positional only. Automatic (`{}`) and manual (`{0}`) numbering
//! cannot be mixed within one pattern. A conversion suffix (`!s`, `!r`) is
//! accepted and ignored.

use crate::error::FormatError;
use crate::value::Value;

/// A parsed composition pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    segments: Vec<Segment>,
    slots: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field { index: usize, spec: Spec },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<Align>,
    zero: bool,
    width: usize,
    precision: Option<usize>,
    code: Option<char>,
}

impl Pattern {
    /// Parse a pattern string.
    pub fn parse(src: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut auto = 0usize;
        let mut manual_max: Option<usize> = None;
        let mut chars = src.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' => {
                    if matches!(chars.peek(), Some((_, '{'))) {
                        chars.next();
                        literal.push('{');
                        continue;
                    }
                    let mut body = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(FormatError::UnbalancedBrace { brace: '{', offset });
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }

                    let (name, spec_src) = match body.split_once(':') {
                        Some((n, s)) => (n, s),
                        None => (body.as_str(), ""),
                    };
                    let name = match name.split_once('!') {
                        Some((n, _conversion)) => n,
                        None => name,
                    };
                    let index = if name.is_empty() {
                        if manual_max.is_some() {
                            return Err(FormatError::MixedNumbering);
                        }
                        auto += 1;
                        auto - 1
                    } else {
                        let i: usize = name
                            .parse()
                            .map_err(|_| FormatError::FieldName { name: name.to_string() })?;
                        if auto > 0 {
                            return Err(FormatError::MixedNumbering);
                        }
                        manual_max = Some(manual_max.map_or(i, |m| m.max(i)));
                        i
                    };
                    segments.push(Segment::Field { index, spec: Spec::parse(spec_src)? });
                }
                '}' => {
                    if matches!(chars.peek(), Some((_, '}'))) {
                        chars.next();
                        literal.push('}');
                    } else {
                        return Err(FormatError::UnbalancedBrace { brace: '}', offset });
                    }
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let slots = match manual_max {
            Some(m) => m + 1,
            None => auto,
        };
        Ok(Self { segments, slots })
    }

    /// Number of positional arguments the pattern consumes.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Render the pattern with `args`. Extra arguments are ignored.
    pub fn render(&self, args: &[Value]) -> Result<String, FormatError> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field { index, spec } => {
                    let value = args.get(*index).ok_or(FormatError::MissingArgument {
                        index: *index,
                        supplied: args.len(),
                    })?;
                    out.push_str(&spec.apply(value)?);
                }
            }
        }
        Ok(out)
    }
}

impl Spec {
    fn parse(src: &str) -> Result<Self, FormatError> {
        let invalid = || FormatError::InvalidSpec { spec: src.to_string() };
        let chars: Vec<char> = src.chars().collect();
        let mut spec = Spec::default();
        let mut i = 0;

        let align_of = |c: char| match c {
            '<' => Some(Align::Left),
            '>' => Some(Align::Right),
            '^' => Some(Align::Center),
            _ => None,
        };

        if chars.len() >= 2 && align_of(chars[1]).is_some() {
            spec.fill = Some(chars[0]);
            spec.align = align_of(chars[1]);
            i = 2;
        } else if let Some(a) = chars.first().and_then(|&c| align_of(c)) {
            spec.align = Some(a);
            i = 1;
        }

        if chars.get(i) == Some(&'0') {
            spec.zero = true;
            i += 1;
        }

        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            let digits: String = chars[start..i].iter().collect();
            spec.width = digits.parse().map_err(|_| invalid())?;
        }

        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            if i == start {
                return Err(invalid());
            }
            let digits: String = chars[start..i].iter().collect();
            spec.precision = Some(digits.parse().map_err(|_| invalid())?);
        }

        match chars.get(i) {
            None => {}
            Some(&c) if matches!(c, 'd' | 's' | 'f' | 'F' | 'x' | 'X') && i + 1 == chars.len() => {
                spec.code = Some(c);
            }
            Some(_) => return Err(invalid()),
        }
        Ok(spec)
    }

    fn apply(&self, value: &Value) -> Result<String, FormatError> {
        let mismatch = |code| FormatError::SpecMismatch { code, value: value.clone() };
        let body = match (self.code, value) {
            (Some('d'), Value::Int(i)) => i.to_string(),
            (Some('x'), Value::Int(i)) => format!("{i:x}"),
            (Some('X'), Value::Int(i)) => format!("{i:X}"),
            (Some(c @ ('f' | 'F')), v) => {
                let x = v.as_float().ok_or_else(|| mismatch(c))?;
                format!("{:.*}", self.precision.unwrap_or(6), x)
            }
            (Some('s'), Value::Str(s)) => truncate(s, self.precision),
            (Some(c), _) => return Err(mismatch(c)),
            (None, Value::Float(x)) if self.precision.is_some() => {
                format!("{:.*}", self.precision.unwrap_or(6), x)
            }
            (None, Value::Str(s)) => truncate(s, self.precision),
            (None, v) => v.to_string(),
        };
        Ok(self.pad(body, !matches!(value, Value::Str(_))))
    }

    fn pad(&self, body: String, numeric: bool) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let missing = self.width - len;

        if self.zero && self.align.is_none() && numeric {
            let (sign, digits) = match body.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("", body.as_str()),
            };
            return format!("{sign}{}{digits}", "0".repeat(missing));
        }

        let fill = self.fill.unwrap_or(if self.zero { '0' } else { ' ' });
        let align = self.align.unwrap_or(if numeric { Align::Right } else { Align::Left });
        let fill_n = |n: usize| std::iter::repeat_n(fill, n).collect::<String>();
        match align {
            Align::Left => format!("{body}{}", fill_n(missing)),
            Align::Right => format!("{}{body}", fill_n(missing)),
            Align::Center => {
                let left = missing / 2;
                format!("{}{body}{}", fill_n(left), fill_n(missing - left))
            }
        }
    }
}

fn truncate(s: &str, precision: Option<usize>) -> String {
    match precision {
        Some(p) => s.chars().take(p).collect(),
        None => s.to_string(),
    }
}
