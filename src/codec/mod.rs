//! Structured-document codec: YAML/JSON parsing and dumping.
//!
//! Parsing goes through [`serde_yaml`], which keeps mapping insertion order
//! and preserves non-plain tags as [`serde_yaml::value::TaggedValue`] nodes,
//! so the evaluator can dispatch on them without a custom parser. JSON input
//! is parsed with [`serde_json`] and lifted into the same tree.
//!
//! Dumping normalises date scalars under `Version` and
//! `AWSTemplateFormatVersion` to ISO `YYYY-MM-DD` strings. YAML 1.1 parsers
//! downstream would otherwise read `2010-09-09` as a date (or `2010-09` as a
//! sexagesimal number) and round-trip it into something the infrastructure
//! API rejects.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_yaml::Value;

use crate::values;

/// Keys whose scalar values are coerced to ISO date strings on dump.
const DATE_SENSITIVE_KEYS: &[&str] = &["Version", "AWSTemplateFormatVersion"];

/// Input format of a document, chosen from its location's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocFormat {
    Yaml,
    Json,
}

impl DocFormat {
    /// Detect the format from a location string. `.json` means JSON,
    /// `.yaml`/`.yml` mean YAML; anything else is `None` so the caller can
    /// decide whether to fall back to raw text.
    pub fn from_location(location: &str) -> Option<Self> {
        let trimmed = location.trim_end_matches('/');
        let ext = trimmed.rsplit('.').next()?;
        match ext {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parse a document from text in the given format.
pub fn parse_str(text: &str, format: DocFormat) -> Result<Value> {
    match format {
        DocFormat::Yaml => {
            serde_yaml::from_str(text).context("failed to parse document as YAML")
        }
        DocFormat::Json => {
            let json: serde_json::Value =
                serde_json::from_str(text).context("failed to parse document as JSON")?;
            Ok(values::from_json(&json))
        }
    }
}

/// Parse a document from raw bytes, choosing the format from `location`.
///
/// Locations without a recognised extension are parsed as YAML; JSON is a
/// subset of YAML, so this is also the right fallback for extensionless
/// JSON payloads.
pub fn parse_bytes(bytes: &[u8], location: &str) -> Result<Value> {
    let text = std::str::from_utf8(bytes)
        .with_context(|| format!("document at '{location}' is not valid UTF-8"))?;
    let format = DocFormat::from_location(location).unwrap_or(DocFormat::Yaml);
    parse_str(text, format).with_context(|| format!("while parsing '{location}'"))
}

/// Dump a document as YAML text.
pub fn dump_yaml(doc: &Value) -> Result<String> {
    let mut doc = doc.clone();
    normalize_version_dates(&mut doc);
    serde_yaml::to_string(&doc).context("failed to serialise document as YAML")
}

/// Dump a document as pretty-printed JSON text.
///
/// Tagged nodes have no JSON representation, so they are unwrapped to their
/// payloads; a transformed output document only carries passthrough tags.
pub fn dump_json(doc: &Value) -> Result<String> {
    let mut doc = doc.clone();
    normalize_version_dates(&mut doc);
    let json = values::to_json(&doc)?;
    serde_json::to_string_pretty(&json).context("failed to serialise document as JSON")
}

/// Rewrite scalars under date-sensitive keys into canonical ISO form.
fn normalize_version_dates(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            for (key, entry) in map.iter_mut() {
                let sensitive = key
                    .as_str()
                    .is_some_and(|k| DATE_SENSITIVE_KEYS.contains(&k));
                if sensitive {
                    if let Some(iso) = as_iso_date(entry) {
                        *entry = Value::String(iso);
                        continue;
                    }
                }
                normalize_version_dates(entry);
            }
        }
        Value::Sequence(seq) => {
            for entry in seq {
                normalize_version_dates(entry);
            }
        }
        Value::Tagged(t) => normalize_version_dates(&mut t.value),
        _ => {}
    }
}

/// If the scalar reads as a calendar date, return it zero-padded ISO.
fn as_iso_date(value: &Value) -> Option<String> {
    let s = value.as_str()?;
    let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()?;
    Some(date.format("%Y-%m-%d").to_string())
}
