//! The lexical environment and the shared global accumulator.

use std::fmt;

use serde_yaml::{Mapping, Value};

use crate::core::PREFIX_BINDING;
use crate::values;

/// One diagnostic frame: the location of the document being walked and the
/// path at which it was entered.
#[derive(Debug, Clone)]
pub struct Frame {
    pub location: String,
    pub path: String,
}

/// The active lexical scope.
///
/// Environments are copy-on-extend: [`Environment::extend`] and
/// [`Environment::with_frame`] return new environments, and nothing ever
/// mutates one in place. That discipline is what keeps imported documents
/// hygienic - a sub-document's bindings can never leak back into its
/// caller's scope.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    values: Mapping,
    frames: Vec<Frame>,
}

impl Environment {
    /// The root environment for a transform: empty scope, one frame.
    pub fn root(location: impl Into<String>) -> Self {
        Self {
            values: Mapping::new(),
            frames: vec![Frame { location: location.into(), path: String::new() }],
        }
    }

    /// The bound names visible in this scope.
    pub fn values(&self) -> &Mapping {
        &self.values
    }

    /// Look up a bound name.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        values::get(&self.values, name)
    }

    /// A new environment with `extra` merged over this scope's bindings.
    pub fn extend(&self, extra: &Mapping) -> Self {
        let mut values = self.values.clone();
        for (k, v) in extra {
            values.insert(k.clone(), v.clone());
        }
        Self { values, frames: self.frames.clone() }
    }

    /// A new environment with one binding added.
    pub fn bind(&self, name: impl Into<String>, value: Value) -> Self {
        let mut values = self.values.clone();
        values.insert(Value::String(name.into()), value);
        Self { values, frames: self.frames.clone() }
    }

    /// A new environment with a diagnostic frame pushed.
    pub fn with_frame(&self, location: impl Into<String>, path: impl Into<String>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(Frame { location: location.into(), path: path.into() });
        Self { values: self.values.clone(), frames }
    }

    /// The location of the innermost frame.
    pub fn location(&self) -> &str {
        self.frames.last().map_or("<unknown>", |f| f.location.as_str())
    }

    /// The active name-rewriting prefix; empty at the root.
    pub fn prefix(&self) -> &str {
        self.lookup(PREFIX_BINDING).and_then(Value::as_str).unwrap_or("")
    }
}

/// Dotted path into the document, for diagnostics and context tests.
#[derive(Debug, Clone, Default)]
pub struct DocPath(Vec<String>);

impl DocPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn index(&self, i: usize) -> Self {
        self.child(i.to_string())
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn contains(&self, segment: &str) -> bool {
        self.0.iter().any(|s| s == segment)
    }

    /// Whether mapping entries at this path are resource declarations:
    /// directly under a `Resources` key and not inside an `Overrides`
    /// sub-tree.
    pub fn in_resources_context(&self) -> bool {
        self.last() == Some("Resources") && !self.contains("Overrides")
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "$")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

/// Collector for sections hoisted out of expanded sub-documents into the
/// root output: `Parameters`, `Metadata`, `Mappings`, `Conditions`,
/// `Transform`, `Outputs`.
///
/// One accumulator is shared across a whole transform; expansion merges into
/// it and assembly drains it. Later merges win on key conflicts within a
/// section.
#[derive(Debug, Default)]
pub struct GlobalAccumulator {
    sections: Mapping,
}

impl GlobalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge entries into a named section.
    pub fn merge_section(&mut self, section: &str, entries: Mapping) {
        match values::get(&self.sections, section).cloned() {
            Some(existing) => {
                let merged = values::deep_merge(existing, &Value::Mapping(entries));
                values::insert(&mut self.sections, section, merged);
            }
            None => {
                values::insert(&mut self.sections, section, Value::Mapping(entries));
            }
        }
    }

    /// The accumulated entries for one section, if any.
    pub fn section(&self, name: &str) -> Option<&Mapping> {
        values::get_mapping(&self.sections, name)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}
