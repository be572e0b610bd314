//! Import loading: the pluggable [`Loader`] trait and its default
//! implementation.
//!
//! The import walker only ever talks to a [`Loader`]; swapping the loader is
//! how the test suite drives whole transforms without touching the network,
//! and how embedders add caching or retries. [`DefaultLoader`] implements
//! the full scheme set:
//!
//! - `file` - local filesystem, `~` expanded
//! - `s3`, `ssm`, `ssm-path` - via the system `aws` CLI
//! - `http`/`https` - plain GET
//! - `env` - process environment, with optional default
//! - `git` - branch / describe / sha of the working tree
//! - `random` - dashed-name / name / int generation
//! - `filehash` - SHA-256 of a file or directory listing
//! - `literal` - the payload itself (deprecated)

pub mod aws;
pub mod command;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use crate::codec::{self, DocFormat};
use crate::core::TransformError;
use crate::location::{self, ImportType, ResolvedLocation};
use crate::values;

use command::ToolCommand;

/// The result of loading one import.
#[derive(Debug, Clone)]
pub struct LoadedImport {
    /// Scheme the location resolved to.
    pub import_type: ImportType,
    /// The canonical resolved location, recorded in the import log.
    pub resolved_location: String,
    /// Raw loaded data. Digests are computed over exactly these bytes.
    pub data: String,
    /// The decoded document: a parsed tree for structured payloads, the raw
    /// string otherwise.
    pub doc: Value,
}

/// A location-backed import fetcher.
///
/// `load` receives the location expression as written and the location of
/// the importing document; resolution against the base is the loader's
/// responsibility so that alternative loaders can remap locations wholesale.
/// Any error aborts the enclosing transform.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, location: &str, base_location: &str) -> Result<LoadedImport>;
}

/// The built-in loader used by [`crate::transform::transform`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoader;

#[async_trait]
impl Loader for DefaultLoader {
    async fn load(&self, location: &str, base_location: &str) -> Result<LoadedImport> {
        let resolved = location::resolve(location, base_location)?;
        tracing::debug!(
            target: "loader",
            location,
            resolved = %resolved.resolved,
            scheme = resolved.import_type.as_str(),
            "loading import"
        );

        match resolved.import_type {
            ImportType::File => load_file(&resolved).await,
            ImportType::S3 => {
                let data = aws::s3_get(&resolved.payload).await?;
                structured(resolved, data)
            }
            ImportType::Http => {
                let data = http_get(&resolved.payload).await?;
                structured(resolved, data)
            }
            ImportType::Ssm => {
                let data = aws::ssm_get_parameter(&resolved.payload).await?;
                structured(resolved, data)
            }
            ImportType::SsmPath => load_ssm_path(resolved).await,
            ImportType::Env => load_env(resolved),
            ImportType::Git => {
                let data = git_value(&resolved.payload).await?;
                raw(resolved, data)
            }
            ImportType::Random => load_random(resolved),
            ImportType::Filehash => {
                let data = filehash(&resolved.payload)?;
                raw(resolved, data)
            }
            ImportType::Literal => {
                tracing::warn!(
                    target: "loader",
                    location,
                    "literal: imports are deprecated; use $defs instead"
                );
                let data = resolved.payload.clone();
                raw(resolved, data)
            }
        }
    }
}

/// Wrap structured data: decode by forced format or location extension,
/// falling back to the raw string.
fn structured(resolved: ResolvedLocation, data: String) -> Result<LoadedImport> {
    let format = resolved.format.or_else(|| DocFormat::from_location(&resolved.resolved));
    let doc = match format {
        Some(f) => codec::parse_str(&data, f)
            .with_context(|| format!("while decoding '{}'", resolved.resolved))?,
        None => Value::String(data.clone()),
    };
    Ok(LoadedImport {
        import_type: resolved.import_type,
        resolved_location: resolved.resolved,
        data,
        doc,
    })
}

/// Wrap an unstructured scalar payload.
fn raw(resolved: ResolvedLocation, data: String) -> Result<LoadedImport> {
    Ok(LoadedImport {
        import_type: resolved.import_type,
        resolved_location: resolved.resolved,
        doc: Value::String(data.clone()),
        data,
    })
}

async fn load_file(resolved: &ResolvedLocation) -> Result<LoadedImport> {
    let data = tokio::fs::read_to_string(&resolved.payload)
        .await
        .map_err(|e| TransformError::ImportResolution {
            location: resolved.resolved.clone(),
            reason: format!("cannot read file: {e}"),
        })?;
    structured(resolved.clone(), data)
}

async fn http_get(url: &str) -> Result<String> {
    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| TransformError::ImportResolution {
            location: url.to_owned(),
            reason: format!("http fetch failed: {e}"),
        })?;
    response
        .text()
        .await
        .with_context(|| format!("while reading response body from '{url}'"))
}

async fn load_ssm_path(resolved: ResolvedLocation) -> Result<LoadedImport> {
    let params = aws::ssm_get_parameters_by_path(&resolved.payload).await?;
    let params = aws::relativize_parameters(&resolved.payload, params);

    let mut map = Mapping::with_capacity(params.len());
    for (name, value) in params {
        let entry = match resolved.format {
            Some(f) => codec::parse_str(&value, f)
                .with_context(|| format!("while decoding ssm parameter '{name}'"))?,
            None => Value::String(value),
        };
        values::insert(&mut map, name, entry);
    }

    let doc = Value::Mapping(map);
    let data = serde_json::to_string(&values::to_json(&doc)?)?;
    Ok(LoadedImport {
        import_type: resolved.import_type,
        resolved_location: resolved.resolved,
        data,
        doc,
    })
}

fn load_env(resolved: ResolvedLocation) -> Result<LoadedImport> {
    let (name, default) = match resolved.payload.split_once(':') {
        Some((name, default)) => (name, Some(default)),
        None => (resolved.payload.as_str(), None),
    };
    let value = match std::env::var(name) {
        Ok(v) => v,
        Err(_) => match default {
            Some(d) => d.to_owned(),
            None => bail!(TransformError::ImportResolution {
                location: resolved.resolved.clone(),
                reason: format!("environment variable '{name}' is not set and has no default"),
            }),
        },
    };
    raw(resolved, value)
}

async fn git_value(kind: &str) -> Result<String> {
    let args: &[&str] = match kind {
        "branch" => &["rev-parse", "--abbrev-ref", "HEAD"],
        "describe" => &["describe", "--dirty"],
        "sha" => &["rev-parse", "HEAD"],
        other => bail!(TransformError::ImportResolution {
            location: format!("git:{other}"),
            reason: "expected one of: branch, describe, sha".into(),
        }),
    };
    ToolCommand::git().args(args.iter().copied()).output_trimmed().await
}

const ADJECTIVES: &[&str] = &[
    "able", "basic", "calm", "daring", "eager", "fancy", "gentle", "happy", "ideal", "jolly",
    "keen", "lively", "merry", "noble", "polite", "quick", "rapid", "steady", "tidy", "vivid",
];

const NOUNS: &[&str] = &[
    "badger", "cedar", "dune", "ember", "falcon", "garnet", "harbor", "island", "juniper", "kestrel",
    "lagoon", "meadow", "nectar", "orchid", "pebble", "quartz", "ridge", "spruce", "tundra", "willow",
];

/// Generate an `adjective-noun-noun` name.
fn dashed_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let first = NOUNS[rng.gen_range(0..NOUNS.len())];
    let second = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adjective}-{first}-{second}")
}

fn load_random(resolved: ResolvedLocation) -> Result<LoadedImport> {
    match resolved.payload.as_str() {
        "dashed-name" => raw(resolved, dashed_name()),
        "name" => {
            // Preserved behaviour: only the first dash is removed.
            let data = dashed_name().replacen('-', "", 1);
            raw(resolved, data)
        }
        "int" => {
            let n: i64 = rand::thread_rng().gen_range(1..1000);
            Ok(LoadedImport {
                import_type: resolved.import_type,
                resolved_location: resolved.resolved,
                data: n.to_string(),
                doc: Value::Number(n.into()),
            })
        }
        other => bail!(TransformError::ImportResolution {
            location: format!("random:{other}"),
            reason: "expected one of: dashed-name, name, int".into(),
        }),
    }
}

/// SHA-256 of a file's bytes, or of the sorted `path:digest` listing of the
/// files under a directory. Either way, hex-encoded.
fn filehash(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path).into_owned();
    let root = std::path::Path::new(&expanded);
    let meta = std::fs::metadata(root).map_err(|e| TransformError::ImportResolution {
        location: format!("filehash:{path}"),
        reason: format!("cannot stat: {e}"),
    })?;

    if meta.is_file() {
        let bytes = std::fs::read(root).with_context(|| format!("while hashing '{path}'"))?;
        return Ok(hex::encode(Sha256::digest(&bytes)));
    }

    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.with_context(|| format!("while walking '{path}'"))?;
        if entry.file_type().is_file() {
            entries.push(entry.into_path());
        }
    }
    entries.sort();

    let mut listing = String::new();
    for file in entries {
        let bytes = std::fs::read(&file)
            .with_context(|| format!("while hashing '{}'", file.display()))?;
        let relative = file.strip_prefix(root).unwrap_or(&file);
        listing.push_str(&format!(
            "{}:{}\n",
            relative.display(),
            hex::encode(Sha256::digest(&bytes))
        ));
    }
    Ok(hex::encode(Sha256::digest(listing.as_bytes())))
}
