//! Core types shared across the transform pipeline.
//!
//! This module provides the crate-wide error type and the reserved meta-key
//! constants that direct the transform. Everything else in the crate depends
//! on it, so it must stay leaf-like: no imports from sibling modules.

pub mod error;

pub use error::TransformError;

/// Mapping key naming the imports of a document.
pub const KEY_IMPORTS: &str = "$imports";

/// Mapping key naming local constant bindings.
pub const KEY_DEFS: &str = "$defs";

/// Mapping key declaring the parameters of a resource template.
pub const KEY_PARAMS: &str = "$params";

/// Mapping key carrying the resolved local scope. Written by the import
/// walker, never by users.
pub const KEY_ENV_VALUES: &str = "$envValues";

/// Mapping key carrying the source location of an imported document.
pub const KEY_LOCATION: &str = "$location";

/// Prefix marking a splice directive inside a mapping (`$merge`, `$merge2`, ...).
pub const KEY_MERGE_PREFIX: &str = "$merge";

/// All meta-keys that are reserved on mappings and stripped from the output.
pub const META_KEYS: &[&str] = &[KEY_IMPORTS, KEY_DEFS, KEY_PARAMS, KEY_ENV_VALUES, KEY_LOCATION];

/// The sections hoisted from expanded sub-documents into the root output.
pub const GLOBAL_SECTIONS: &[&str] =
    &["Parameters", "Metadata", "Mappings", "Conditions", "Transform", "Outputs"];

/// Environment binding holding the active name-rewriting prefix.
pub const PREFIX_BINDING: &str = "Prefix";
