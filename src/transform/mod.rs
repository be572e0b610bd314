//! The transform entry points and output assembly.
//!
//! [`transform`] wires the pipeline together: import resolution, the tree
//! walk, then assembly of the final document - global-section merging,
//! CloudFormation skeleton seeding, provenance stamping, and meta-key
//! stripping. [`transform_with_loader`] is the same pipeline over a
//! caller-supplied [`Loader`], which is the seam the test suite drives
//! whole transforms through.

use anyhow::Result;
use serde_yaml::{Mapping, Value};

use crate::core::{GLOBAL_SECTIONS, KEY_LOCATION, META_KEYS};
use crate::evaluator::{DocPath, Environment, Evaluator, GlobalAccumulator};
use crate::imports::{self, ImportRecord};
use crate::loader::{DefaultLoader, Loader};
use crate::values;

/// Transform a root document using the built-in loader.
pub async fn transform(root: Value, root_location: &str) -> Result<Value> {
    transform_with_loader(root, root_location, &DefaultLoader).await
}

/// Transform a root document, fetching imports through `loader`.
///
/// The transform is pure given its inputs: any failure aborts with no
/// partial output, and nothing is persisted.
pub async fn transform_with_loader(
    root: Value,
    root_location: &str,
    loader: &dyn Loader,
) -> Result<Value> {
    let mut doc = root;
    if let Value::Mapping(map) = &mut doc {
        values::insert(map, KEY_LOCATION, Value::String(root_location.to_owned()));
    }

    let mut records = Vec::new();
    imports::load_imports(&mut doc, root_location, loader, &mut records).await?;
    tracing::debug!(target: "transform", imports = records.len(), "import graph resolved");

    let mut globals = GlobalAccumulator::new();
    let env = Environment::root(root_location);
    let output = Evaluator::new(&mut globals).eval(&doc, &env, &DocPath::root())?;

    assemble(output, &records, &globals)
}

/// Finalise the evaluated root document.
fn assemble(
    output: Value,
    records: &[ImportRecord],
    globals: &GlobalAccumulator,
) -> Result<Value> {
    let Value::Mapping(mut out) = output else {
        // Scalar and sequence roots have nothing to stamp or merge.
        return Ok(output);
    };

    let cfn_like = values::contains_key(&out, "AWSTemplateFormatVersion")
        || values::contains_key(&out, "Resources");
    if cfn_like {
        values::insert(&mut out, "AWSTemplateFormatVersion", Value::String("2010-09-09".into()));
        for section in ["Parameters", "Conditions", "Mappings", "Outputs"] {
            if !values::contains_key(&out, section) {
                values::insert(&mut out, section, Value::Mapping(Mapping::new()));
            }
        }
        stamp_provenance(&mut out, records)?;
    }

    // Hoisted sections land last, winning over root-level entries.
    for section in GLOBAL_SECTIONS {
        let Some(hoisted) = globals.section(section) else { continue };
        if hoisted.is_empty() {
            continue;
        }
        let existing =
            values::get(&out, section).cloned().unwrap_or(Value::Mapping(Mapping::new()));
        let merged = values::deep_merge(existing, &Value::Mapping(hoisted.clone()));
        values::insert(&mut out, *section, merged);
    }

    for key in META_KEYS {
        values::remove(&mut out, key);
    }
    Ok(Value::Mapping(out))
}

/// Record who ran the transform and what it pulled in under
/// `Metadata.iidy`.
///
/// The stamp deep-merges over any existing `Metadata.iidy`, and `Imports`
/// is only written when something was actually imported - re-transforming
/// an already-transformed document leaves it unchanged.
fn stamp_provenance(out: &mut Mapping, records: &[ImportRecord]) -> Result<()> {
    let mut stamp = Mapping::new();
    values::insert(&mut stamp, "Host", Value::String(env_or_unknown(&["HOSTNAME", "HOST"])));
    values::insert(&mut stamp, "User", Value::String(env_or_unknown(&["USER", "USERNAME"])));
    if !records.is_empty() {
        values::insert(&mut stamp, "Imports", serde_yaml::to_value(records)?);
    }

    let mut metadata =
        values::get_mapping(out, "Metadata").cloned().unwrap_or_default();
    let existing =
        values::get(&metadata, "iidy").cloned().unwrap_or(Value::Mapping(Mapping::new()));
    let merged = values::deep_merge(existing, &Value::Mapping(stamp));
    values::insert(&mut metadata, "iidy", merged);
    values::insert(out, "Metadata", Value::Mapping(metadata));
    Ok(())
}

fn env_or_unknown(names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_owned())
}
