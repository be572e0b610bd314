//! Import location syntax and resolution.
//!
//! A location is written `scheme:payload[:format]`. Absence of a scheme
//! means `file`. The optional `:json`/`:yaml` suffix forces how the fetched
//! bytes are decoded, independent of the location's extension.
//!
//! Resolution is relative to the *base* location (the document doing the
//! importing): `file` paths resolve against the base's directory, `s3` keys
//! against the base's key directory, `http` URLs against the base URL.
//! When the base itself is remote (`s3` or `http`), an unscoped child
//! inherits the base's scheme, and `file:`/`env:` children are rejected so a
//! remote template cannot read secrets off the machine running the
//! transform.

use anyhow::{bail, Result};
use url::Url;

use crate::codec::DocFormat;
use crate::core::TransformError;

/// The scheme of an import location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportType {
    File,
    S3,
    Http,
    Ssm,
    SsmPath,
    Env,
    Git,
    Random,
    Filehash,
    Literal,
}

impl ImportType {
    /// The scheme name as written in location strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::S3 => "s3",
            Self::Http => "http",
            Self::Ssm => "ssm",
            Self::SsmPath => "ssm-path",
            Self::Env => "env",
            Self::Git => "git",
            Self::Random => "random",
            Self::Filehash => "filehash",
            Self::Literal => "literal",
        }
    }

    /// Whether documents from this scheme live outside the local machine.
    ///
    /// Remote bases restrict what their children may import.
    pub fn is_remote(self) -> bool {
        matches!(self, Self::S3 | Self::Http)
    }

    /// Whether the fetched payload is a document that the `:json`/`:yaml`
    /// format suffix (and extension sniffing) applies to.
    fn takes_format_suffix(self) -> bool {
        matches!(self, Self::File | Self::S3 | Self::Http | Self::Ssm | Self::SsmPath)
    }
}

/// A fully-resolved import location, ready for the loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub import_type: ImportType,
    /// The canonical location string recorded in the import log. Carries the
    /// scheme for every scheme except `file`, which is recorded as a plain
    /// path.
    pub resolved: String,
    /// The scheme-less payload handed to the fetcher.
    pub payload: String,
    /// Decoding forced by a `:json`/`:yaml` suffix, if any.
    pub format: Option<DocFormat>,
}

/// Split an explicit scheme prefix off a location string.
///
/// Returns `None` when the location carries no scheme (a bare file path).
/// Unknown schemes are an error rather than a fallback to `file`, so typos
/// like `s3s://` fail loudly.
fn split_scheme(location: &str) -> Result<Option<(ImportType, &str)>> {
    // Longest-prefix first: `ssm-path:` must win over `ssm:`.
    const SCHEMES: &[(&str, ImportType)] = &[
        ("ssm-path:", ImportType::SsmPath),
        ("filehash:", ImportType::Filehash),
        ("literal:", ImportType::Literal),
        ("random:", ImportType::Random),
        ("https:", ImportType::Http),
        ("http:", ImportType::Http),
        ("file:", ImportType::File),
        ("env:", ImportType::Env),
        ("git:", ImportType::Git),
        ("ssm:", ImportType::Ssm),
        ("s3:", ImportType::S3),
    ];
    for (prefix, import_type) in SCHEMES {
        if let Some(rest) = location.strip_prefix(prefix) {
            // `https:` children keep their original scheme in the payload so
            // URL resolution sees the full URL.
            let payload = if *import_type == ImportType::Http { location } else { rest };
            return Ok(Some((*import_type, payload)));
        }
    }
    // Anything else shaped like `scheme:...` is a typo, not a file path.
    if let Some((candidate, _)) = location.split_once(':') {
        let scheme_like = !candidate.is_empty()
            && candidate.chars().all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c))
            && candidate.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && candidate.len() > 1;
        if scheme_like && !location.starts_with("./") && !location.starts_with('/') {
            bail!(TransformError::ImportResolution {
                location: location.to_owned(),
                reason: format!("unknown import scheme '{candidate}'"),
            });
        }
    }
    Ok(None)
}

/// Strip a trailing `:json`/`:yaml` format suffix.
fn split_format_suffix(payload: &str) -> (&str, Option<DocFormat>) {
    if let Some(rest) = payload.strip_suffix(":json") {
        (rest, Some(DocFormat::Json))
    } else if let Some(rest) = payload.strip_suffix(":yaml") {
        (rest, Some(DocFormat::Yaml))
    } else {
        (payload, None)
    }
}

/// Classify a location in isolation, without relative resolution.
///
/// Used for base locations, where only the scheme matters.
pub fn classify(location: &str) -> Result<ImportType> {
    Ok(split_scheme(location)?.map_or(ImportType::File, |(t, _)| t))
}

/// Resolve a location expression against its base.
///
/// This classifies the scheme (applying the remote inheritance rule),
/// enforces the remote security boundary, strips the format suffix, and
/// resolves relative references.
pub fn resolve(location: &str, base_location: &str) -> Result<ResolvedLocation> {
    let base_type = classify(base_location)?;
    let explicit = split_scheme(location)?;

    let (import_type, raw_payload) = match explicit {
        Some((t, payload)) => {
            if base_type.is_remote() && matches!(t, ImportType::File | ImportType::Env) {
                bail!(TransformError::ImportResolution {
                    location: location.to_owned(),
                    reason: format!(
                        "'{}:' imports are not allowed from a remote ({}) base",
                        t.as_str(),
                        base_type.as_str()
                    ),
                });
            }
            (t, payload)
        }
        // Unscoped children of a remote base inherit the base's scheme.
        None if base_type.is_remote() => (base_type, location),
        None => (ImportType::File, location),
    };

    if import_type == ImportType::File && base_type != ImportType::File {
        tracing::warn!(
            base = base_location,
            import = location,
            "file import from a non-file base context"
        );
    }

    let (payload, format) = if import_type.takes_format_suffix() {
        split_format_suffix(raw_payload)
    } else {
        (raw_payload, None)
    };

    match import_type {
        ImportType::File => resolve_file(payload, base_location, format),
        ImportType::S3 => resolve_s3(payload, base_location, base_type, format),
        ImportType::Http => resolve_http(payload, base_location, base_type, format),
        ImportType::SsmPath => {
            // The prefix always ends with `/` so returned parameter names can
            // be relativised against it.
            let mut prefix = payload.to_owned();
            if !prefix.ends_with('/') {
                prefix.push('/');
            }
            Ok(ResolvedLocation {
                import_type,
                resolved: format!("ssm-path:{prefix}"),
                payload: prefix,
                format,
            })
        }
        _ => Ok(ResolvedLocation {
            import_type,
            resolved: format!("{}:{}", import_type.as_str(), payload),
            payload: payload.to_owned(),
            format,
        }),
    }
}

fn resolve_file(
    payload: &str,
    base_location: &str,
    format: Option<DocFormat>,
) -> Result<ResolvedLocation> {
    let expanded = shellexpand::tilde(payload).into_owned();
    let path = std::path::Path::new(&expanded);
    let resolved = if path.is_absolute() {
        expanded
    } else {
        // Relative to the directory of the base document.
        let base_payload = match split_scheme(base_location)? {
            Some((ImportType::File, p)) => p,
            _ => base_location,
        };
        let base_path = shellexpand::tilde(base_payload).into_owned();
        let base_dir = std::path::Path::new(&base_path).parent().unwrap_or_else(|| "".as_ref());
        base_dir.join(path).to_string_lossy().into_owned()
    };
    Ok(ResolvedLocation {
        import_type: ImportType::File,
        payload: resolved.clone(),
        resolved,
        format,
    })
}

fn resolve_s3(
    payload: &str,
    base_location: &str,
    base_type: ImportType,
    format: Option<DocFormat>,
) -> Result<ResolvedLocation> {
    let resolved = if let Some(rest) = payload.strip_prefix("//") {
        // Absolute `s3://bucket/key`.
        if !rest.contains('/') {
            bail!(TransformError::ImportResolution {
                location: format!("s3:{payload}"),
                reason: "s3 location must name a bucket and key: s3://bucket/key".into(),
            });
        }
        format!("s3://{rest}")
    } else {
        // Relative key, resolved against the base's key directory.
        if base_type != ImportType::S3 {
            bail!(TransformError::ImportResolution {
                location: payload.to_owned(),
                reason: "relative s3 key used outside an s3 base context".into(),
            });
        }
        let base = base_location.strip_prefix("s3://").unwrap_or(base_location);
        let key_dir = match base.rfind('/') {
            Some(idx) => &base[..idx],
            None => base,
        };
        format!("s3://{key_dir}/{payload}")
    };
    Ok(ResolvedLocation {
        import_type: ImportType::S3,
        payload: resolved.clone(),
        resolved,
        format,
    })
}

fn resolve_http(
    payload: &str,
    base_location: &str,
    base_type: ImportType,
    format: Option<DocFormat>,
) -> Result<ResolvedLocation> {
    let resolved = if payload.starts_with("http://") || payload.starts_with("https://") {
        Url::parse(payload)
    } else {
        if base_type != ImportType::Http {
            bail!(TransformError::ImportResolution {
                location: payload.to_owned(),
                reason: "relative http reference used outside an http base context".into(),
            });
        }
        Url::parse(base_location).and_then(|base| base.join(payload))
    }
    .map_err(|e| TransformError::ImportResolution {
        location: payload.to_owned(),
        reason: format!("invalid URL: {e}"),
    })?;
    Ok(ResolvedLocation {
        import_type: ImportType::Http,
        payload: resolved.to_string(),
        resolved: resolved.to_string(),
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_paths_are_file_scheme() {
        let loc = resolve("sub/child.yaml", "dir/stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::File);
        assert_eq!(loc.resolved, "dir/sub/child.yaml");
    }

    #[test]
    fn absolute_file_paths_ignore_the_base() {
        let loc = resolve("/etc/config.yaml", "dir/stack.yaml").unwrap();
        assert_eq!(loc.resolved, "/etc/config.yaml");
    }

    #[test]
    fn format_suffix_is_stripped() {
        let loc = resolve("file:params.txt:json", "stack.yaml").unwrap();
        assert_eq!(loc.format, Some(DocFormat::Json));
        assert_eq!(loc.resolved, "params.txt");

        let loc = resolve("ssm:/app/config:yaml", "stack.yaml").unwrap();
        assert_eq!(loc.format, Some(DocFormat::Yaml));
        assert_eq!(loc.payload, "/app/config");
    }

    #[test]
    fn env_default_is_not_a_format_suffix() {
        let loc = resolve("env:STAGE:json", "stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::Env);
        assert_eq!(loc.payload, "STAGE:json");
        assert_eq!(loc.format, None);
    }

    #[test]
    fn s3_relative_keys_resolve_against_the_base_key_dir() {
        let loc = resolve("other.yaml", "s3://bucket/envs/prod/stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::S3);
        assert_eq!(loc.resolved, "s3://bucket/envs/prod/other.yaml");
    }

    #[test]
    fn http_relative_urls_resolve_against_the_base() {
        let loc = resolve("common.yaml", "https://example.com/stacks/app.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::Http);
        assert_eq!(loc.resolved, "https://example.com/stacks/common.yaml");
    }

    #[test]
    fn remote_base_rejects_local_schemes() {
        for child in ["file:secrets.yaml", "env:SECRET"] {
            let err = resolve(child, "s3://bucket/stack.yaml").unwrap_err();
            assert!(err.to_string().contains("not allowed from a remote"), "{err}");
        }
        let err = resolve("env:SECRET", "https://example.com/stack.yaml").unwrap_err();
        assert!(err.to_string().contains("not allowed from a remote"));
    }

    #[test]
    fn remote_base_children_stay_remote_with_explicit_schemes() {
        let loc = resolve("git:sha", "s3://bucket/stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::Git);
    }

    #[test]
    fn ssm_path_prefix_gets_a_trailing_slash() {
        let loc = resolve("ssm-path:/app/config", "stack.yaml").unwrap();
        assert_eq!(loc.payload, "/app/config/");
        let loc = resolve("ssm-path:/app/config/", "stack.yaml").unwrap();
        assert_eq!(loc.payload, "/app/config/");
    }

    #[test]
    fn unknown_schemes_fail() {
        let err = resolve("s3s://bucket/key", "stack.yaml").unwrap_err();
        assert!(err.to_string().contains("unknown import scheme"), "{err}");
    }

    #[test]
    fn ssm_path_wins_over_ssm() {
        let loc = resolve("ssm-path:/a/", "stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::SsmPath);
        let loc = resolve("ssm:/a/b", "stack.yaml").unwrap();
        assert_eq!(loc.import_type, ImportType::Ssm);
    }
}
