//! Resource-template expansion.
//!
//! A mapping that declares `$params` is a resource template. Templates enter
//! a document's scope through `$imports` or `$defs` and are invoked in two
//! ways:
//!
//! - as a resource `Type` under a `Resources` key, which expands the
//!   template's own `Resources` with a name prefix and hoists its global
//!   sections into the root output;
//! - via the `!$expand {template, params}` macro, which splices the
//!   template's evaluated body in place, with no prefixing or parameter
//!   validation.
//!
//! Expansion validates supplied parameters against the template's `$params`
//! declarations: a JSON `Schema`, an `AllowedValues` list, or an
//! `AllowedPattern` regex, in that order of preference.

use anyhow::{bail, Context, Result};
use serde_yaml::{Mapping, Value};

use crate::core::{
    TransformError, GLOBAL_SECTIONS, KEY_ENV_VALUES, KEY_PARAMS, PREFIX_BINDING,
};
use crate::evaluator::{DocPath, Environment, Evaluator};
use crate::values;

/// One declaration out of a template's `$params` sequence.
struct ParamDecl {
    name: String,
    default: Option<Value>,
    schema: Option<Value>,
    allowed_values: Option<Vec<Value>>,
    allowed_pattern: Option<String>,
}

impl ParamDecl {
    fn parse(decl: &Value, caller: &str, path: &DocPath) -> Result<Self> {
        let err = |reason: String| TransformError::ParameterValidation {
            parameter: "<declaration>".into(),
            caller: caller.to_owned(),
            path: path.to_string(),
            reason,
        };
        let Some(decl) = decl.as_mapping() else {
            bail!(err(format!("$params entries must be mappings, got {}", values::kind_of(decl))));
        };
        let Some(name) = values::get_str(decl, "Name") else {
            bail!(err("$params entry is missing a Name".into()));
        };
        Ok(Self {
            name: name.to_owned(),
            default: values::get(decl, "Default").cloned(),
            schema: values::get(decl, "Schema").cloned(),
            allowed_values: values::get(decl, "AllowedValues")
                .and_then(Value::as_sequence)
                .cloned(),
            allowed_pattern: values::get(decl, "AllowedPattern").map(|v| {
                v.as_str().map(str::to_owned).unwrap_or_else(|| format!("{v:?}"))
            }),
        })
    }
}

impl Evaluator<'_> {
    /// Evaluate one entry of a `Resources` mapping, returning the resource
    /// entries to emit in its place.
    ///
    /// A `Type` naming a template in scope triggers expansion; a `Type`
    /// with a native `AWS`/`Custom` prefix is evaluated in place; anything
    /// else is an error. Entries that are not mappings (or carry no `Type`)
    /// are evaluated as ordinary nodes.
    pub(crate) fn expand_resource_entry(
        &mut self,
        name: &str,
        body: &Value,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Mapping> {
        let mut single = |this: &mut Self| -> Result<Mapping> {
            let mut out = Mapping::new();
            values::insert(&mut out, name, this.eval(body, env, path)?);
            Ok(out)
        };

        let Some(body_map) = body.as_mapping() else {
            return single(self);
        };
        let Some(type_name) = values::get_str(body_map, "Type").map(str::to_owned) else {
            return single(self);
        };

        let template = self
            .lookup_path(&type_name, env, path)
            .ok()
            .filter(values::is_template);
        match template {
            Some(template) => self.expand_template(name, body_map, &template, env, path),
            None if type_name.starts_with("AWS") || type_name.starts_with("Custom") => {
                single(self)
            }
            None => bail!(TransformError::TemplateUse {
                type_name,
                path: path.to_string(),
                reason: "neither a template in scope nor a native resource type".into(),
            }),
        }
    }

    /// Expand a template invoked as a resource `Type`.
    fn expand_template(
        &mut self,
        name: &str,
        body: &Mapping,
        template: &Value,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Mapping> {
        let template_map = template
            .as_mapping()
            .expect("is_template guarantees a mapping");

        // 1. The prefix rewrites every emitted name; it defaults to the
        // resource's own key.
        let prefix = match values::get(body, "NamePrefix") {
            Some(p) => {
                let evaluated = self.eval(p, env, &path.child("NamePrefix"))?;
                match evaluated {
                    Value::String(s) => s,
                    other => bail!(TransformError::TemplateUse {
                        type_name: name.to_owned(),
                        path: path.to_string(),
                        reason: format!(
                            "NamePrefix must be a string, got {}",
                            values::kind_of(&other)
                        ),
                    }),
                }
            }
            None => name.to_owned(),
        };
        tracing::debug!(target: "expander", resource = name, prefix = %prefix, "expanding template");

        // 2. Overrides are evaluated in the caller's scope before the merge,
        // so their $includes resolve against the caller.
        let resource_doc = match values::get(body, "Overrides") {
            Some(overrides) => {
                let evaluated = self.eval(overrides, env, &path.child("Overrides"))?;
                values::deep_merge(template.clone(), &evaluated)
            }
            None => template.clone(),
        };
        let resource_doc = resource_doc.as_mapping().cloned().unwrap_or_default();

        let template_env_values =
            values::get_mapping(template_map, KEY_ENV_VALUES).cloned().unwrap_or_default();
        let prefix_binding = {
            let mut m = Mapping::new();
            values::insert(&mut m, PREFIX_BINDING, Value::String(prefix.clone()));
            m
        };

        // 3. Parameter defaults see the prefix and the template's own scope.
        let decls = param_decls(template_map, name, path)?;
        let defaults_env = env.extend(&prefix_binding).extend(&template_env_values);
        let mut defaults = Mapping::new();
        for decl in &decls {
            if let Some(default) = &decl.default {
                let evaluated = self.eval(default, &defaults_env, &path.child("$params"))?;
                values::insert(&mut defaults, decl.name.clone(), evaluated);
            }
        }

        // 4-5. Supplied properties win over defaults.
        let provided = match values::get(body, "Properties") {
            Some(props) => {
                let evaluated = self.eval(props, env, &path.child("Properties"))?;
                match evaluated {
                    Value::Mapping(m) => m,
                    other => bail!(TransformError::TemplateUse {
                        type_name: name.to_owned(),
                        path: path.to_string(),
                        reason: format!(
                            "Properties must be a mapping, got {}",
                            values::kind_of(&other)
                        ),
                    }),
                }
            }
            None => Mapping::new(),
        };
        let mut merged_params = defaults.clone();
        for (k, v) in &provided {
            merged_params.insert(k.clone(), v.clone());
        }

        // 6. Validate every declared parameter.
        for decl in &decls {
            self.validate_param(decl, &merged_params, name, env, path)?;
        }

        // 7. The expansion scope, inner bindings shadowing outer ones; the
        // template's own lexical scope wins over everything.
        let sub_env = env
            .extend(&prefix_binding)
            .extend(&defaults)
            .extend(&provided)
            .extend(&template_env_values)
            .with_frame(
                values::get_str(template_map, crate::core::KEY_LOCATION)
                    .unwrap_or_else(|| env.location())
                    .to_owned(),
                path.to_string(),
            );

        // 8. Emit the template's resources under prefixed names.
        let mut out = Mapping::new();
        if let Some(resources) = values::get(&resource_doc, "Resources") {
            let resources_path = path.child("Resources");
            let evaluated = self.eval(resources, &sub_env, &resources_path)?;
            let Value::Mapping(resources) = evaluated else {
                bail!(TransformError::TemplateUse {
                    type_name: name.to_owned(),
                    path: resources_path.to_string(),
                    reason: "template Resources must be a mapping".into(),
                });
            };
            for (r, resource) in resources {
                let emitted = format!("{prefix}{}", values::key_to_string(&r)?);
                values::insert(&mut out, emitted, resource);
            }
        }

        // 9. Hoist the template's global sections with prefixed keys.
        for section in GLOBAL_SECTIONS {
            let Some(entries) = values::get(&resource_doc, section) else { continue };
            let evaluated = self.eval(entries, &sub_env, &path.child(*section))?;
            let Value::Mapping(entries) = evaluated else {
                bail!(TransformError::TemplateUse {
                    type_name: name.to_owned(),
                    path: path.child(*section).to_string(),
                    reason: format!("template {section} must be a mapping"),
                });
            };
            let mut renamed = Mapping::with_capacity(entries.len());
            for (k, v) in entries {
                values::insert(&mut renamed, format!("{prefix}{}", values::key_to_string(&k)?), v);
            }
            self.globals.merge_section(section, renamed);
        }

        Ok(out)
    }

    fn validate_param(
        &self,
        decl: &ParamDecl,
        params: &Mapping,
        caller: &str,
        env: &Environment,
        path: &DocPath,
    ) -> Result<()> {
        let fail = |reason: String| TransformError::ParameterValidation {
            parameter: decl.name.clone(),
            caller: caller.to_owned(),
            path: path.to_string(),
            reason,
        };

        let Some(value) = values::get(params, &decl.name) else {
            bail!(fail(format!("missing required parameter (in {})", env.location())));
        };

        if let Some(schema) = &decl.schema {
            if !schema.is_mapping() {
                bail!(fail(format!(
                    "Schema declaration must be a mapping, got {}",
                    values::kind_of(schema)
                )));
            }
            let schema_json = values::to_json(schema)?;
            let validator = jsonschema::validator_for(&schema_json)
                .map_err(|e| fail(format!("Schema does not compile: {e}")))?;
            let instance = values::to_json(value)?;
            let violations: Vec<String> =
                validator.iter_errors(&instance).map(|e| e.to_string()).collect();
            if !violations.is_empty() {
                bail!(fail(format!(
                    "value {} does not match schema {} (from {}): {}",
                    compact(&instance),
                    compact(&schema_json),
                    env.location(),
                    violations.join("; ")
                )));
            }
        } else if let Some(allowed) = &decl.allowed_values {
            if !allowed.contains(value) {
                bail!(fail(format!(
                    "value {} is not one of the allowed values {} (from {})",
                    describe(value),
                    allowed.iter().map(describe).collect::<Vec<_>>().join(", "),
                    env.location()
                )));
            }
        } else if let Some(pattern) = &decl.allowed_pattern {
            let re = regex::Regex::new(pattern)
                .with_context(|| format!("invalid AllowedPattern for parameter '{}'", decl.name))?;
            let Some(s) = value.as_str() else {
                bail!(fail(format!(
                    "AllowedPattern applies to strings, got {}",
                    values::kind_of(value)
                )));
            };
            if !re.is_match(s) {
                bail!(fail(format!("value '{s}' does not match pattern '{pattern}'")));
            }
        }
        Ok(())
    }

    /// The `!$expand` macro: splice a template's body in place.
    ///
    /// Unlike resource-type expansion there is no prefixing, defaulting or
    /// validation; the supplied params are simply merged over the caller's
    /// scope.
    pub(crate) fn eval_expand_macro(
        &mut self,
        payload: &Value,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Value> {
        let shape = |reason: &str| TransformError::MacroShape {
            tag: "$expand".into(),
            path: path.to_string(),
            reason: reason.to_owned(),
        };
        let Some(spec) = payload.as_mapping() else {
            bail!(shape("payload must be a mapping"));
        };
        let Some(template_name) = values::get_str(spec, "template") else {
            bail!(shape("missing 'template' name"));
        };

        let template = self.lookup_path(template_name, env, path)?;
        if !values::is_template(&template) {
            bail!(TransformError::TemplateUse {
                type_name: template_name.to_owned(),
                path: path.to_string(),
                reason: "$expand target is not a template (no $params)".into(),
            });
        }

        let params = match values::get(spec, "params") {
            Some(params) => {
                let evaluated = self.eval(params, env, &path.child("params"))?;
                match evaluated {
                    Value::Mapping(m) => m,
                    other => bail!(shape(&format!(
                        "'params' must be a mapping, got {}",
                        values::kind_of(&other)
                    ))),
                }
            }
            None => Mapping::new(),
        };

        let mut clone = template.as_mapping().cloned().unwrap_or_default();
        values::remove(&mut clone, KEY_PARAMS);
        self.eval(&Value::Mapping(clone), &env.extend(&params), path)
    }
}

/// Parse the template's `$params` declarations.
fn param_decls(template: &Mapping, caller: &str, path: &DocPath) -> Result<Vec<ParamDecl>> {
    let Some(params) = values::get(template, KEY_PARAMS) else {
        return Ok(Vec::new());
    };
    let Some(params) = params.as_sequence() else {
        bail!(TransformError::ParameterValidation {
            parameter: "<declaration>".into(),
            caller: caller.to_owned(),
            path: path.to_string(),
            reason: format!("$params must be a sequence, got {}", values::kind_of(params)),
        });
    };
    params.iter().map(|decl| ParamDecl::parse(decl, caller, path)).collect()
}

fn compact(json: &serde_json::Value) -> String {
    serde_json::to_string(json).unwrap_or_else(|_| json.to_string())
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => serde_yaml::to_string(other).map(|s| s.trim_end().to_owned()).unwrap_or_default(),
    }
}
