//! The import graph walker.
//!
//! Operating on one document at a time, the walker loads every `$imports`
//! entry in declaration order through the [`Loader`], binds the results -
//! together with `$defs` - into the document's `$envValues`, and recurses
//! into loaded documents that have imports of their own. Ordering is
//! observable: a later import's location expression may reference an
//! earlier import via `{{...}}` interpolation.
//!
//! Every completed load appends an [`ImportRecord`] to a flat log shared
//! across the whole transform; the record's digest is the SHA-256 of the
//! raw bytes the loader returned. On failure the log keeps the records
//! completed so far, which is the transform's debugging breadcrumb trail.
//!
//! Names are bound with key-membership semantics: binding the same name
//! twice within one document is a collision even if both bindings would
//! have carried the same value.

use std::future::Future;
use std::pin::Pin;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::core::{TransformError, KEY_DEFS, KEY_ENV_VALUES, KEY_IMPORTS, KEY_LOCATION, KEY_PARAMS};
use crate::loader::Loader;
use crate::templating;
use crate::values;

/// Bound on import recursion, the transform's only cycle defence.
pub const MAX_IMPORT_DEPTH: usize = 64;

/// Provenance for one resolved import, in discovery order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImportRecord {
    /// The name the import is bound under.
    pub key: String,
    /// The location expression, after interpolation.
    pub from: String,
    /// The fully-resolved location.
    pub imported: String,
    /// SHA-256 of the raw loaded bytes, hex-encoded.
    #[serde(rename = "sha256Digest")]
    pub sha256_digest: String,
}

/// Resolve a document's imports and populate its `$envValues`.
///
/// `doc` is mutated in place: after a successful walk it carries a fully
/// resolved `$envValues` mapping (and so do all documents imported beneath
/// it). Non-mapping documents have no scope and are left untouched.
pub async fn load_imports(
    doc: &mut Value,
    base_location: &str,
    loader: &dyn Loader,
    records: &mut Vec<ImportRecord>,
) -> Result<()> {
    load_imports_at_depth(doc, base_location, loader, records, 0).await
}

/// Boxed recursion: the future type would otherwise be infinite.
fn load_imports_at_depth<'a>(
    doc: &'a mut Value,
    base_location: &'a str,
    loader: &'a dyn Loader,
    records: &'a mut Vec<ImportRecord>,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let Value::Mapping(map) = doc else {
            return Ok(());
        };
        if depth > MAX_IMPORT_DEPTH {
            bail!(TransformError::ImportResolution {
                location: base_location.to_owned(),
                reason: format!(
                    "import nesting exceeded {MAX_IMPORT_DEPTH} levels; \
                     is there an import cycle?"
                ),
            });
        }

        let mut env_values = Mapping::new();

        let imports = values::get_mapping(map, KEY_IMPORTS).cloned().unwrap_or_default();
        for (as_key, loc_expr) in &imports {
            let as_key = values::key_to_string(as_key)?;
            let Some(loc_expr) = loc_expr.as_str() else {
                bail!(TransformError::ImportResolution {
                    location: base_location.to_owned(),
                    reason: format!(
                        "$imports.{as_key} must be a location string, got {}",
                        values::kind_of(loc_expr)
                    ),
                });
            };

            // Later imports may interpolate earlier ones into their
            // location.
            let loc = if templating::has_template_syntax(loc_expr) {
                templating::render(
                    loc_expr,
                    &env_values,
                    &format!("$imports.{as_key}"),
                    base_location,
                )?
            } else {
                loc_expr.to_owned()
            };

            if values::contains_key(&env_values, &as_key) {
                bail!(TransformError::NameCollision {
                    name: as_key,
                    location: base_location.to_owned(),
                    reason: "bound more than once in $imports".into(),
                });
            }

            let loaded = loader
                .load(&loc, base_location)
                .await
                .with_context(|| format!("while importing '{as_key}' into '{base_location}'"))?;
            tracing::debug!(
                target: "imports",
                key = %as_key,
                from = %loc,
                resolved = %loaded.resolved_location,
                "import loaded"
            );

            records.push(ImportRecord {
                key: as_key.clone(),
                from: loc.clone(),
                imported: loaded.resolved_location.clone(),
                sha256_digest: hex::encode(Sha256::digest(loaded.data.as_bytes())),
            });

            let mut imported_doc = loaded.doc;
            if let Value::Mapping(imported_map) = &mut imported_doc {
                values::insert(
                    imported_map,
                    KEY_LOCATION,
                    Value::String(loaded.resolved_location.clone()),
                );
                let has_scope = values::contains_key(imported_map, KEY_IMPORTS)
                    || values::contains_key(imported_map, KEY_DEFS);
                if has_scope {
                    load_imports_at_depth(
                        &mut imported_doc,
                        &loaded.resolved_location,
                        loader,
                        records,
                        depth + 1,
                    )
                    .await?;
                }
            }
            values::insert(&mut env_values, as_key, imported_doc);
        }

        if let Some(defs) = values::get_mapping(map, KEY_DEFS).cloned() {
            for (name, value) in defs {
                let name = values::key_to_string(&name)?;
                if values::contains_key(&env_values, &name) {
                    bail!(TransformError::NameCollision {
                        name,
                        location: base_location.to_owned(),
                        reason: "$defs name collides with an import".into(),
                    });
                }
                values::insert(&mut env_values, name, value);
            }
        }

        // Parameters are bound at expansion time, but their names must not
        // shadow the document's own scope.
        if let Some(params) = values::get(map, KEY_PARAMS).and_then(Value::as_sequence) {
            for decl in params {
                let Some(name) = decl.as_mapping().and_then(|d| values::get_str(d, "Name"))
                else {
                    continue;
                };
                if values::contains_key(&env_values, name) {
                    bail!(TransformError::NameCollision {
                        name: name.to_owned(),
                        location: base_location.to_owned(),
                        reason: "$params name collides with an import or def".into(),
                    });
                }
            }
        }

        values::insert(map, KEY_ENV_VALUES, Value::Mapping(env_values));
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryLoader;
    use crate::values::{get, get_mapping, get_str};

    async fn walk(root: &str, loader: &MemoryLoader) -> Result<(Value, Vec<ImportRecord>)> {
        let mut doc: Value = serde_yaml::from_str(root).unwrap();
        let mut records = Vec::new();
        load_imports(&mut doc, "root.yaml", loader, &mut records).await?;
        Ok((doc, records))
    }

    #[tokio::test]
    async fn binds_imports_and_defs() {
        let loader = MemoryLoader::new().with("cfg.yaml", "region: us-east-1\n");
        let (doc, records) = walk(
            "$imports: {cfg: cfg.yaml}\n$defs: {stage: prod}\nBody: 1",
            &loader,
        )
        .await
        .unwrap();

        let env = get_mapping(doc.as_mapping().unwrap(), "$envValues").unwrap();
        assert_eq!(get_str(get_mapping(env, "cfg").unwrap(), "region"), Some("us-east-1"));
        assert_eq!(get_str(env, "stage"), Some("prod"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "cfg");
    }

    #[tokio::test]
    async fn digest_matches_the_raw_bytes() {
        let body = "a: 1\n";
        let loader = MemoryLoader::new().with("cfg.yaml", body);
        let (_, records) = walk("$imports: {cfg: cfg.yaml}", &loader).await.unwrap();

        assert_eq!(records[0].sha256_digest, hex::encode(Sha256::digest(body.as_bytes())));
        assert_eq!(records[0].imported, "cfg.yaml");
    }

    #[tokio::test]
    async fn imported_mappings_are_stamped_with_their_location() {
        let loader = MemoryLoader::new().with("cfg.yaml", "a: 1\n");
        let (doc, _) = walk("$imports: {cfg: cfg.yaml}", &loader).await.unwrap();

        let env = get_mapping(doc.as_mapping().unwrap(), "$envValues").unwrap();
        assert_eq!(get_str(get_mapping(env, "cfg").unwrap(), "$location"), Some("cfg.yaml"));
    }

    #[tokio::test]
    async fn rebinding_an_import_name_collides_even_with_an_identical_value() {
        // Key-membership semantics: rebinding `cfg` fails even when the new
        // binding would carry the same value as the import.
        let loader = MemoryLoader::new().with("cfg.yaml", "a: 1\n");
        let err = walk("$imports: {cfg: cfg.yaml}\n$defs: {cfg: {a: 1}}", &loader)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'cfg'"), "{err}");
    }

    #[tokio::test]
    async fn param_names_may_not_shadow_imports() {
        let loader = MemoryLoader::new().with("cfg.yaml", "a: 1\n");
        let err = walk(
            "$imports: {cfg: cfg.yaml}\n$params:\n  - Name: cfg",
            &loader,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("collides"), "{err}");
    }

    #[tokio::test]
    async fn later_imports_interpolate_earlier_ones() {
        let loader = MemoryLoader::new()
            .with("env:STAGE", "prod")
            .with("prod-params.yaml", "size: large\n");
        let mut doc: Value = serde_yaml::from_str(
            "$imports:\n  stage: 'env:STAGE'\n  params: '{{stage}}-params.yaml'",
        )
        .unwrap();
        let mut records = Vec::new();
        load_imports(&mut doc, "root.yaml", &loader, &mut records).await.unwrap();

        assert_eq!(records[1].from, "prod-params.yaml");
        let env = get_mapping(doc.as_mapping().unwrap(), "$envValues").unwrap();
        assert_eq!(get_str(get_mapping(env, "params").unwrap(), "size"), Some("large"));
    }

    #[tokio::test]
    async fn recursion_resolves_nested_scopes() {
        let loader = MemoryLoader::new()
            .with("outer.yaml", "$imports: {inner: inner.yaml}\nName: outer\n")
            .with("inner.yaml", "Name: inner\n");
        let (doc, records) = walk("$imports: {outer: outer.yaml}", &loader).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, "inner");

        let env = get_mapping(doc.as_mapping().unwrap(), "$envValues").unwrap();
        let outer = get_mapping(env, "outer").unwrap();
        let outer_env = get_mapping(outer, "$envValues").unwrap();
        assert!(values::contains_key(outer_env, "inner"));
    }

    #[tokio::test]
    async fn failed_imports_keep_the_records_so_far() {
        let loader = MemoryLoader::new().with("first.yaml", "a: 1\n");
        let mut doc: Value =
            serde_yaml::from_str("$imports: {first: first.yaml, second: missing.yaml}").unwrap();
        let mut records = Vec::new();
        let err = load_imports(&mut doc, "root.yaml", &loader, &mut records).await.unwrap_err();

        assert!(err.to_string().contains("second"), "{err}");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "first");
    }

    #[tokio::test]
    async fn import_cycles_hit_the_depth_bound() {
        let loader =
            MemoryLoader::new().with("a.yaml", "$imports: {a: a.yaml}\n");
        let err = walk("$imports: {a: a.yaml}", &loader).await.unwrap_err();
        assert!(err.to_string().contains("nesting exceeded"), "{err}");
    }

    #[test]
    fn records_serialise_with_camel_case_digest() {
        let record = ImportRecord {
            key: "cfg".into(),
            from: "cfg.yaml".into(),
            imported: "cfg.yaml".into(),
            sha256_digest: "abc".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"sha256Digest\":\"abc\""), "{json}");
    }
}
