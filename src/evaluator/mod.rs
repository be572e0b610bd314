//! The tree-walking evaluator.
//!
//! [`Evaluator::eval`] takes a document node, the active [`Environment`],
//! and the dotted [`DocPath`] reached so far, and produces a new tree:
//!
//! - strings containing `{{...}}` are interpolated against the scope;
//! - sequences are walked element-wise;
//! - mappings drop the reserved meta-keys, splice `$merge`-prefixed
//!   entries, and hand entries under a `Resources` key to the template
//!   expander;
//! - tagged nodes dispatch on [`TagKind`]: the data-level macros are
//!   interpreted, `Ref` payloads are rewritten with the active prefix, and
//!   every other tag is rebuilt around its evaluated payload so nothing is
//!   silently dropped.
//!
//! A mapping that carries `$envValues` is a document produced by the import
//! walker; re-entering one first resolves its own scope hygienically before
//! walking its body (see [`Evaluator::eval_imported_doc`]).

pub mod env;

use anyhow::{bail, Result};
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};

use crate::core::{
    TransformError, KEY_ENV_VALUES, KEY_LOCATION, KEY_MERGE_PREFIX, KEY_PARAMS, META_KEYS,
};
use crate::templating;
use crate::values::{self, TagKind};

pub use env::{DocPath, Environment, Frame, GlobalAccumulator};

/// Evaluation recursion bound. Cyclic `$include`s inside a single document
/// are not detected structurally, so the walker refuses to recurse forever
/// instead of overflowing the stack.
const MAX_EVAL_DEPTH: usize = 256;

/// The tree walker. One instance lives for the duration of a transform,
/// sharing the global accumulator with the template expander.
pub struct Evaluator<'a> {
    pub(crate) globals: &'a mut GlobalAccumulator,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(globals: &'a mut GlobalAccumulator) -> Self {
        Self { globals, depth: 0 }
    }

    /// Evaluate one node, producing a new tree.
    pub fn eval(&mut self, value: &Value, env: &Environment, path: &DocPath) -> Result<Value> {
        self.depth += 1;
        if self.depth > MAX_EVAL_DEPTH {
            self.depth -= 1;
            bail!(
                "evaluation exceeded {MAX_EVAL_DEPTH} levels at {path} ({}); \
                 is there a cyclic $include?",
                env.location()
            );
        }
        let result = self.eval_inner(value, env, path);
        self.depth -= 1;
        result
    }

    fn eval_inner(&mut self, value: &Value, env: &Environment, path: &DocPath) -> Result<Value> {
        match value {
            Value::String(s) if templating::has_template_syntax(s) => {
                let rendered =
                    templating::render(s, env.values(), &path.to_string(), env.location())?;
                Ok(Value::String(rendered))
            }
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
                Ok(value.clone())
            }
            Value::Sequence(seq) => {
                let mut out = Vec::with_capacity(seq.len());
                for (i, item) in seq.iter().enumerate() {
                    out.push(self.eval(item, env, &path.index(i))?);
                }
                Ok(Value::Sequence(out))
            }
            Value::Mapping(map) => {
                if values::contains_key(map, KEY_ENV_VALUES) {
                    self.eval_imported_doc(map, env, path)
                } else {
                    Ok(Value::Mapping(self.eval_mapping(map, env, path)?))
                }
            }
            Value::Tagged(tagged) => self.eval_tagged(tagged, env, path),
        }
    }

    /// Walk a plain mapping's entries.
    ///
    /// Also the body walk for imported documents and expanded templates,
    /// which is why it is visible to the expander.
    pub(crate) fn eval_mapping(
        &mut self,
        map: &Mapping,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Mapping> {
        if values::contains_key(map, KEY_PARAMS) {
            bail!(TransformError::TemplateUse {
                type_name: path.last().unwrap_or("<root>").to_owned(),
                path: path.to_string(),
                reason: "a template cannot be emitted directly; expand it via $expand or use \
                         it as a resource Type"
                    .into(),
            });
        }

        let mut out = Mapping::new();
        for (key, entry) in map {
            let key = values::key_to_string(key)?;
            if META_KEYS.contains(&key.as_str()) {
                continue;
            }
            if key.starts_with(KEY_MERGE_PREFIX) {
                self.splice_merge(&key, entry, &mut out, env, path)?;
            } else if path.in_resources_context() {
                let expanded =
                    self.expand_resource_entry(&key, entry, env, &path.child(key.as_str()))?;
                for (name, resource) in expanded {
                    out.insert(name, resource);
                }
            } else {
                let evaluated = self.eval(entry, env, &path.child(key.as_str()))?;
                values::insert(&mut out, key, evaluated);
            }
        }
        Ok(out)
    }

    /// Evaluate a `$merge`-prefixed entry and splice its entries into the
    /// mapping under construction.
    fn splice_merge(
        &mut self,
        key: &str,
        entry: &Value,
        out: &mut Mapping,
        env: &Environment,
        path: &DocPath,
    ) -> Result<()> {
        let merged = self.eval(entry, env, &path.child(key))?;
        let Value::Mapping(entries) = merged else {
            bail!(TransformError::MacroShape {
                tag: KEY_MERGE_PREFIX.into(),
                path: path.child(key).to_string(),
                reason: format!("$merge value must evaluate to a mapping, got {}",
                    values::kind_of(&merged)),
            });
        };
        for (k, v) in entries {
            if out.contains_key(&k) {
                bail!(TransformError::MergeConflict {
                    key: values::key_to_string(&k)?,
                    path: path.to_string(),
                });
            }
            out.insert(k, v);
        }
        Ok(())
    }

    /// Re-enter a document produced by the import walker.
    ///
    /// The document's own `$envValues` are resolved first, in a scope seeded
    /// by those same raw values, so intra-import `$include`s see the
    /// import's lexical scope rather than the caller's. The body is then
    /// walked with the processed scope merged over the outer one.
    fn eval_imported_doc(
        &mut self,
        map: &Mapping,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Value> {
        let own = values::get_mapping(map, KEY_ENV_VALUES).cloned().unwrap_or_default();
        let location =
            values::get_str(map, KEY_LOCATION).unwrap_or_else(|| env.location()).to_owned();

        let seeded = env.extend(&own).with_frame(location.clone(), path.to_string());
        let mut processed = Mapping::new();
        for (name, bound) in &own {
            if values::is_template(bound) {
                processed.insert(name.clone(), bound.clone());
            } else {
                let scope_path = path.child(format!("$envValues.{}", values::key_to_string(name)?));
                processed.insert(name.clone(), self.eval(bound, &seeded, &scope_path)?);
            }
        }

        let body_env = env.extend(&processed).with_frame(location, path.to_string());
        Ok(Value::Mapping(self.eval_mapping(map, &body_env, path)?))
    }

    fn eval_tagged(
        &mut self,
        tagged: &TaggedValue,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Value> {
        let payload = &tagged.value;
        match TagKind::classify(&tagged.tag) {
            TagKind::Escape => Ok(payload.clone()),

            TagKind::Include => {
                let target = self.macro_string_payload("$include", payload, path)?;
                let found = self.lookup_path(&target, env, path)?;
                self.eval(&found, env, path)
            }

            TagKind::Ref => match payload {
                Value::String(name) if name.starts_with("AWS:") => {
                    Ok(Value::Tagged(Box::new(tagged.clone())))
                }
                Value::String(name) => {
                    let rewritten = format!("{}{}", env.prefix(), name);
                    Ok(values::tagged("Ref", Value::String(rewritten)))
                }
                other => {
                    let evaluated = self.eval(other, env, path)?;
                    Ok(values::tagged("Ref", evaluated))
                }
            },

            TagKind::Expand => self.eval_expand_macro(payload, env, path),

            TagKind::String => {
                let mut evaluated = self.eval(payload, env, path)?;
                if let Value::Sequence(seq) = &evaluated {
                    if seq.len() == 1 {
                        evaluated = seq[0].clone();
                    }
                }
                let dumped = serde_yaml::to_string(&evaluated).map_err(|e| {
                    TransformError::MacroShape {
                        tag: "$string".into(),
                        path: path.to_string(),
                        reason: format!("value cannot be serialised: {e}"),
                    }
                })?;
                Ok(Value::String(dumped))
            }

            TagKind::ParseYaml => {
                let evaluated = self.eval(payload, env, path)?;
                let Value::String(text) = &evaluated else {
                    bail!(TransformError::MacroShape {
                        tag: "$parseYaml".into(),
                        path: path.to_string(),
                        reason: format!(
                            "expected a string to parse, got {}",
                            values::kind_of(&evaluated)
                        ),
                    });
                };
                let parsed: Value = serde_yaml::from_str(text).map_err(|e| {
                    TransformError::MacroShape {
                        tag: "$parseYaml".into(),
                        path: path.to_string(),
                        reason: format!("payload is not valid YAML: {e}"),
                    }
                })?;
                self.eval(&parsed, env, path)
            }

            TagKind::Let => {
                let Value::Mapping(bindings) = payload else {
                    bail!(self.shape_error("$let", path, "payload must be a mapping"));
                };
                let Some(body) = values::get(bindings, "in") else {
                    bail!(self.shape_error("$let", path, "missing 'in' body"));
                };
                let mut extra = Mapping::new();
                for (name, bound) in bindings {
                    if name.as_str() == Some("in") {
                        continue;
                    }
                    extra.insert(name.clone(), self.eval(bound, env, path)?);
                }
                self.eval(body, &env.extend(&extra), path)
            }

            TagKind::Map => {
                let items = self.eval_map_macro("$map", payload, env, path)?;
                Ok(Value::Sequence(items))
            }

            TagKind::Flatten => {
                let evaluated = self.eval(payload, env, path)?;
                Ok(Value::Sequence(self.flatten_one_level("$flatten", evaluated, path)?))
            }

            TagKind::ConcatMap => {
                let mapped = self.eval_map_macro("$concatMap", payload, env, path)?;
                let flat = self.flatten_one_level("$concatMap", Value::Sequence(mapped), path)?;
                Ok(Value::Sequence(flat))
            }

            TagKind::MapListToHash => {
                let pairs = self.eval_map_macro("$mapListToHash", payload, env, path)?;
                Ok(Value::Mapping(self.pairs_to_mapping("$mapListToHash", &pairs, path)?))
            }

            TagKind::FromPairs => {
                let evaluated = self.eval(payload, env, path)?;
                let Value::Sequence(pairs) = evaluated else {
                    bail!(self.shape_error("$fromPairs", path, "payload must be a sequence"));
                };
                Ok(Value::Mapping(self.pairs_to_mapping("$fromPairs", &pairs, path)?))
            }

            TagKind::Passthrough => {
                let evaluated = self.eval(payload, env, path)?;
                Ok(Value::Tagged(Box::new(TaggedValue {
                    tag: tagged.tag.clone(),
                    value: evaluated,
                })))
            }
        }
    }

    /// The `$map` core shared by `$map`, `$concatMap` and `$mapListToHash`:
    /// evaluate `items`, then evaluate `template` once per item in a scope
    /// binding the item variable and its index.
    fn eval_map_macro(
        &mut self,
        tag: &str,
        payload: &Value,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Vec<Value>> {
        let Value::Mapping(spec) = payload else {
            bail!(self.shape_error(tag, path, "payload must be a mapping"));
        };
        let Some(items) = values::get(spec, "items") else {
            bail!(self.shape_error(tag, path, "missing 'items'"));
        };
        let Some(template) = values::get(spec, "template") else {
            bail!(self.shape_error(tag, path, "missing 'template'"));
        };
        let var = values::get_str(spec, "var").unwrap_or("item");

        let items = self.eval(items, env, &path.child("items"))?;
        let Value::Sequence(items) = items else {
            bail!(self.shape_error(
                tag,
                path,
                &format!("'items' must evaluate to a sequence, got {}", values::kind_of(&items)),
            ));
        };

        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let scoped = env
                .bind(var, item)
                .bind(format!("{var}Idx"), Value::Number(i.into()));
            out.push(self.eval(template, &scoped, &path.index(i))?);
        }
        Ok(out)
    }

    fn flatten_one_level(&self, tag: &str, value: Value, path: &DocPath) -> Result<Vec<Value>> {
        let Value::Sequence(outer) = value else {
            bail!(self.shape_error(tag, path, "payload must evaluate to a sequence of sequences"));
        };
        let mut flat = Vec::new();
        for element in outer {
            let Value::Sequence(inner) = element else {
                bail!(self.shape_error(
                    tag,
                    path,
                    &format!("expected inner sequences, got {}", values::kind_of(&element)),
                ));
            };
            flat.extend(inner);
        }
        Ok(flat)
    }

    /// Lift `[{key, value}, ...]` into a mapping.
    fn pairs_to_mapping(&self, tag: &str, pairs: &[Value], path: &DocPath) -> Result<Mapping> {
        let mut out = Mapping::with_capacity(pairs.len());
        for pair in pairs {
            let entry = pair.as_mapping().and_then(|m| {
                Some((values::get(m, "key")?, values::get(m, "value")?))
            });
            let Some((key, value)) = entry else {
                bail!(self.shape_error(tag, path, "every element must be a {key, value} mapping"));
            };
            values::insert(&mut out, values::key_to_string(key)?, value.clone());
        }
        Ok(out)
    }

    /// Resolve a dotted `name.sel1.sel2` expression against the scope.
    pub(crate) fn lookup_path(
        &self,
        target: &str,
        env: &Environment,
        path: &DocPath,
    ) -> Result<Value> {
        let mut segments = target.split('.');
        let root = segments.next().unwrap_or(target);
        let Some(mut current) = env.lookup(root) else {
            bail!(TransformError::Lookup {
                name: root.to_owned(),
                path: path.to_string(),
                location: env.location().to_owned(),
            });
        };
        let mut resolved = root.to_owned();
        for selector in segments {
            let next = match current {
                Value::Mapping(m) => values::get(m, selector),
                Value::Sequence(seq) => {
                    selector.parse::<usize>().ok().and_then(|i| seq.get(i))
                }
                Value::Tagged(t) => t.value.as_mapping().and_then(|m| values::get(m, selector)),
                _ => None,
            };
            resolved = format!("{resolved}.{selector}");
            current = next.ok_or_else(|| TransformError::Lookup {
                name: resolved.clone(),
                path: path.to_string(),
                location: env.location().to_owned(),
            })?;
        }
        Ok(current.clone())
    }

    fn macro_string_payload(&self, tag: &str, payload: &Value, path: &DocPath) -> Result<String> {
        match payload {
            Value::String(s) => Ok(s.clone()),
            other => bail!(self.shape_error(
                tag,
                path,
                &format!("payload must be a string, got {}", values::kind_of(other)),
            )),
        }
    }

    fn shape_error(&self, tag: &str, path: &DocPath, reason: &str) -> TransformError {
        TransformError::MacroShape {
            tag: tag.to_owned(),
            path: path.to_string(),
            reason: reason.to_owned(),
        }
    }
}
