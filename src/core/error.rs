//! Error types for the document transform.
//!
//! The transform surfaces every failure as a single error carrying the dotted
//! document path and the location of the frame where it occurred. Variants
//! are grouped by the stage that raises them: import resolution, name
//! binding, evaluation, template expansion, and string interpolation.
//!
//! Functions across the crate return [`anyhow::Result`] and attach context
//! with [`anyhow::Context`]; a [`TransformError`] sits at the root of the
//! chain so callers and tests can match on the failure kind.

use thiserror::Error;

/// The error type for all failures raised by the transform core.
///
/// No partial output is ever produced alongside one of these: the first
/// failure aborts the whole transform. The import record log accumulated
/// before the failure is retained for debuggability.
#[derive(Debug, Error)]
pub enum TransformError {
    /// A location string could not be classified, resolved, or fetched.
    ///
    /// Covers unknown schemes, schemes disallowed from a remote base,
    /// invalid URIs, loader failures, and missing environment variables.
    #[error("import of '{location}' failed: {reason}")]
    ImportResolution {
        /// The location expression as written (or as resolved, for fetch failures).
        location: String,
        /// Why the import could not be completed.
        reason: String,
    },

    /// A name was bound more than once across `$imports`, `$defs` and
    /// `$params` within a single document.
    #[error("duplicate name '{name}' in {location}: {reason}")]
    NameCollision {
        name: String,
        location: String,
        reason: String,
    },

    /// `$include` or interpolation referenced an unbound name, or a dotted
    /// selector did not resolve inside the looked-up value.
    #[error("'{name}' is not bound at {path} ({location})")]
    Lookup {
        name: String,
        path: String,
        location: String,
    },

    /// A resource referenced a `Type` that is neither a template in scope nor
    /// a recognised native prefix, or a template was emitted unexpanded.
    #[error("invalid resource type '{type_name}' at {path}: {reason}")]
    TemplateUse {
        type_name: String,
        path: String,
        reason: String,
    },

    /// A template parameter failed validation at expansion time.
    ///
    /// Covers missing required parameters, JSON-Schema failures,
    /// `AllowedValues` mismatches, `AllowedPattern` mismatches, and
    /// non-mapping schema declarations.
    #[error("parameter '{parameter}' of '{caller}' at {path}: {reason}")]
    ParameterValidation {
        parameter: String,
        /// Name of the resource (or `$expand` site) supplying the parameters.
        caller: String,
        path: String,
        reason: String,
    },

    /// A macro tag received a payload of the wrong shape.
    #[error("malformed {tag} payload at {path}: {reason}")]
    MacroShape {
        tag: String,
        path: String,
        reason: String,
    },

    /// A `$merge` splice collided with a key already written to the mapping.
    #[error("$merge would overwrite existing key '{key}' at {path}")]
    MergeConflict { key: String, path: String },

    /// A `{{...}}` template failed to compile or render.
    #[error("interpolation failed at {path} ({location}): {reason}")]
    Interpolation {
        path: String,
        location: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_path_and_location() {
        let err = TransformError::Lookup {
            name: "missing".into(),
            path: "Resources.foo.Properties".into(),
            location: "stack.yaml".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("missing"));
        assert!(msg.contains("Resources.foo.Properties"));
        assert!(msg.contains("stack.yaml"));
    }

    #[test]
    fn merge_conflict_names_the_key() {
        let err = TransformError::MergeConflict {
            key: "Port".into(),
            path: "Resources.api.Properties".into(),
        };
        assert!(err.to_string().contains("'Port'"));
    }
}
