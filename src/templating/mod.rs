//! `{{...}}` string interpolation against the active scope.
//!
//! Interpolation is backed by Tera, configured for strict resolution: an
//! unresolved variable is an error, not an empty string. A fresh engine is
//! created per render (cheap, just empty maps) with three custom filters
//! registered:
//!
//! - `tojson` - serialise the value as compact JSON
//! - `toyaml` - serialise the value as YAML
//! - `base64` - base64-encode the value (strings as-is, other values as JSON)
//!
//! The scope handed to a render is the evaluator's `$envValues` mapping;
//! dotted access like `{{config.db.host}}` resolves through nested
//! mappings.

use std::collections::HashMap;

use anyhow::Result;
use base64::Engine as _;
use serde_yaml::Mapping;
use tera::Tera;

use crate::core::TransformError;
use crate::values;

/// Whether a string contains template syntax worth rendering.
pub fn has_template_syntax(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Render a template string against the given scope.
///
/// `path` and `location` are diagnostic coordinates baked into the error on
/// failure.
pub fn render(template: &str, scope: &Mapping, path: &str, location: &str) -> Result<String> {
    let mut context = tera::Context::new();
    for (key, value) in scope {
        let Some(name) = key.as_str() else { continue };
        match values::to_json(value) {
            Ok(json) => context.insert(name, &json),
            Err(e) => {
                // A binding that cannot cross into the render context only
                // matters if the template references it; strict mode will
                // then report it as unresolved.
                tracing::debug!(target: "templating", name, error = %e, "binding skipped");
            }
        }
    }

    let mut tera = Tera::default();
    tera.register_filter("tojson", filter_tojson);
    tera.register_filter("toyaml", filter_toyaml);
    tera.register_filter("base64", filter_base64);

    tera.render_str(template, &context).map_err(|e| {
        TransformError::Interpolation {
            path: path.to_owned(),
            location: location.to_owned(),
            reason: describe_tera_error(&e),
        }
        .into()
    })
}

/// Flatten a Tera error chain into one line, hiding the internal one-off
/// template name.
fn describe_tera_error(error: &tera::Error) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    parts
        .join(": ")
        .replace("while rendering '__tera_one_off'", "")
        .replace("Failed to render '__tera_one_off'", "template rendering failed")
        .replace("Failed to parse '__tera_one_off'", "template syntax error")
        .replace("'__tera_one_off'", "template")
}

fn filter_tojson(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let rendered = serde_json::to_string(value).map_err(tera::Error::msg)?;
    Ok(tera::Value::String(rendered))
}

fn filter_toyaml(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let rendered = serde_yaml::to_string(value).map_err(tera::Error::msg)?;
    Ok(tera::Value::String(rendered.trim_end().to_owned()))
}

fn filter_base64(
    value: &tera::Value,
    _args: &HashMap<String, tera::Value>,
) -> tera::Result<tera::Value> {
    let plain = match value {
        tera::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).map_err(tera::Error::msg)?,
    };
    Ok(tera::Value::String(base64::engine::general_purpose::STANDARD.encode(plain)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn scope(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn renders_simple_variables() {
        let out = render("hello {{name}}", &scope("name: world"), "Message", "t.yaml").unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn renders_dotted_access() {
        let out =
            render("{{cfg.db.host}}", &scope("cfg: {db: {host: pg}}"), "X", "t.yaml").unwrap();
        assert_eq!(out, "pg");
    }

    #[test]
    fn unresolved_variable_is_an_error() {
        let err = render("{{missing}}", &Mapping::new(), "Message", "t.yaml").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Message"), "{msg}");
        assert!(!msg.contains("__tera_one_off"), "{msg}");
    }

    #[test]
    fn tojson_filter() {
        let out = render("{{cfg | tojson}}", &scope("cfg: {a: 1}"), "X", "t.yaml").unwrap();
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[test]
    fn toyaml_filter() {
        let out = render("{{cfg | toyaml}}", &scope("cfg: {a: 1}"), "X", "t.yaml").unwrap();
        assert_eq!(out, "a: 1");
    }

    #[test]
    fn base64_filter_encodes_strings_plainly() {
        let out = render("{{secret | base64}}", &scope("secret: hush"), "X", "t.yaml").unwrap();
        assert_eq!(out, "aHVzaA==");
    }

    #[test]
    fn tagged_bindings_cross_as_their_payload() {
        let mut s = Mapping::new();
        values::insert(&mut s, "arn", values::tagged("GetAtt", Value::String("a.Arn".into())));
        let out = render("{{arn}}", &s, "X", "t.yaml").unwrap();
        assert_eq!(out, "a.Arn");
    }
}
