//! Helpers over the `serde_yaml::Value` document tree.
//!
//! The whole pipeline operates on [`serde_yaml::Value`]: mappings keep
//! insertion order, and non-plain YAML tags arrive as
//! [`serde_yaml::value::TaggedValue`] nodes, which is exactly the shape the
//! evaluator dispatches on. This module adds the pieces serde_yaml does not
//! provide: classification of the tag set understood by the evaluator,
//! string-keyed mapping access, conversion to and from `serde_json::Value`
//! (for interpolation contexts and JSON-Schema validation), and the
//! override-wins deep merge used by overrides, parameter merging and
//! provenance stamping.

use anyhow::{bail, Result};
use serde_yaml::value::{Tag, TaggedValue};
use serde_yaml::{Mapping, Value};

use crate::core::KEY_PARAMS;

/// The tag kinds understood by the evaluator.
///
/// Anything not listed here is [`TagKind::Passthrough`]: the walker recurses
/// into its payload and rebuilds the node under the same tag, so downstream
/// tags like `!GetAtt` or `!Sub` survive the transform untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// `!Ref name` - rewritten with the active prefix unless the payload
    /// starts with `AWS:`.
    Ref,
    /// `!$include name.sel1.sel2` - splice a value from the local scope.
    Include,
    /// `!$expand {template, params}` - expand a template in place.
    Expand,
    /// `!$escape x` - return the payload unevaluated.
    Escape,
    /// `!$string v` - serialise the evaluated payload to a YAML string.
    String,
    /// `!$parseYaml s` - parse the evaluated payload as YAML, then evaluate it.
    ParseYaml,
    /// `!$let {bindings..., in: body}` - scoped bindings.
    Let,
    /// `!$map {items, template, var?}` - map a template over a sequence.
    Map,
    /// `!$flatten seq-of-seqs` - concatenate one level.
    Flatten,
    /// `!$concatMap {...}` - `$flatten` composed with `$map`.
    ConcatMap,
    /// `!$mapListToHash {...}` - `$map`, then lift `[{key, value}]` pairs.
    MapListToHash,
    /// `!$fromPairs pairs` - lift `[{key, value}]` pairs into a mapping.
    FromPairs,
    /// Any other tag; recursed into and preserved.
    Passthrough,
}

impl TagKind {
    /// Classify a YAML tag into the evaluator's dispatch table.
    pub fn classify(tag: &Tag) -> Self {
        match tag_name(tag).as_str() {
            "Ref" => Self::Ref,
            "$include" => Self::Include,
            "$expand" => Self::Expand,
            "$escape" => Self::Escape,
            "$string" => Self::String,
            "$parseYaml" => Self::ParseYaml,
            "$let" => Self::Let,
            "$map" => Self::Map,
            "$flatten" => Self::Flatten,
            "$concatMap" => Self::ConcatMap,
            "$mapListToHash" => Self::MapListToHash,
            "$fromPairs" => Self::FromPairs,
            _ => Self::Passthrough,
        }
    }
}

/// The tag's name without the leading `!`.
pub fn tag_name(tag: &Tag) -> String {
    let s = tag.to_string();
    s.strip_prefix('!').unwrap_or(&s).to_owned()
}

/// Build a tagged node.
pub fn tagged(tag: impl Into<String>, payload: Value) -> Value {
    Value::Tagged(Box::new(TaggedValue { tag: Tag::new(tag.into()), value: payload }))
}

/// Look up a string key in a mapping.
pub fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(key)
}

/// Look up a string key and expect a mapping value.
pub fn get_mapping<'a>(map: &'a Mapping, key: &str) -> Option<&'a Mapping> {
    get(map, key).and_then(Value::as_mapping)
}

/// Look up a string key and expect a string value.
pub fn get_str<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    get(map, key).and_then(Value::as_str)
}

/// Insert under a string key, returning the previous value if any.
pub fn insert(map: &mut Mapping, key: impl Into<String>, value: Value) -> Option<Value> {
    map.insert(Value::String(key.into()), value)
}

/// Remove a string key.
pub fn remove(map: &mut Mapping, key: &str) -> Option<Value> {
    map.remove(key)
}

/// Whether a mapping contains a string key.
pub fn contains_key(map: &Mapping, key: &str) -> bool {
    map.contains_key(key)
}

/// A short human label for a value's kind, for error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged node",
    }
}

/// Whether a value is a resource template: a mapping carrying `$params`.
pub fn is_template(value: &Value) -> bool {
    value.as_mapping().is_some_and(|m| contains_key(m, KEY_PARAMS))
}

/// Convert a document value to JSON for interpolation contexts and
/// JSON-Schema validation.
///
/// Tagged nodes are unwrapped to their payload: by the time a value reaches
/// an interpolation context it has already been evaluated, so a remaining
/// tag is a passthrough node whose payload is the meaningful data.
///
/// # Errors
///
/// Fails on mapping keys that are not scalars, and on non-finite floats
/// (JSON cannot represent them).
pub fn to_json(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                let f = n.as_f64().unwrap_or_default();
                match serde_json::Number::from_f64(f) {
                    Some(num) => serde_json::Value::Number(num),
                    None => bail!("number {f} has no JSON representation"),
                }
            }
        }
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Sequence(seq) => {
            serde_json::Value::Array(seq.iter().map(to_json).collect::<Result<_>>()?)
        }
        Value::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(key_to_string(k)?, to_json(v)?);
            }
            serde_json::Value::Object(out)
        }
        Value::Tagged(t) => to_json(&t.value)?,
    })
}

/// Convert a JSON value back into the document tree.
pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Number(u.into())
            } else {
                Value::Number(serde_yaml::Number::from(n.as_f64().unwrap_or_default()))
            }
        }
        serde_json::Value::String(s) => Value::String(s.clone()),
        serde_json::Value::Array(items) => Value::Sequence(items.iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            let mut out = Mapping::with_capacity(map.len());
            for (k, v) in map {
                out.insert(Value::String(k.clone()), from_json(v));
            }
            Value::Mapping(out)
        }
    }
}

/// Render a mapping key as a string. Non-scalar keys are rejected; the
/// document language only uses string keys.
pub fn key_to_string(key: &Value) -> Result<String> {
    Ok(match key {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => bail!("unsupported mapping key of kind {}", kind_of(other)),
    })
}

/// Deep merge `overrides` into `base`, overrides winning.
///
/// Mappings merge recursively; sequences, scalars and tagged nodes from
/// `overrides` replace the base value wholesale.
pub fn deep_merge(base: Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Mapping(mut base_map), Value::Mapping(override_map)) => {
            for (key, override_value) in override_map {
                match base_map.get_mut(key) {
                    Some(base_value)
                        if base_value.is_mapping() && override_value.is_mapping() =>
                    {
                        let merged = deep_merge(base_value.clone(), override_value);
                        base_map.insert(key.clone(), merged);
                    }
                    _ => {
                        base_map.insert(key.clone(), override_value.clone());
                    }
                }
            }
            Value::Mapping(base_map)
        }
        (_, other) => other.clone(),
    }
}
