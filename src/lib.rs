//! iidy - a pre-processor for CloudFormation-style infrastructure documents.
//!
//! iidy ingests a root YAML or JSON document, resolves a tree of `$imports`,
//! evaluates data-level macros and `{{...}}` string interpolation, expands
//! user-defined resource templates into concrete resource sets, and emits a
//! fully-resolved document suitable for direct consumption by the downstream
//! infrastructure API.
//!
//! # Architecture Overview
//!
//! The transform pipeline runs in three stages:
//! - **Import resolution** ([`imports`]): every `$imports` entry is fetched
//!   through a pluggable [`loader::Loader`], bound into the document's local
//!   scope (`$envValues`), and recorded with a SHA-256 digest for provenance.
//! - **Evaluation** ([`evaluator`], [`expander`]): a tree walk over the
//!   document dispatching on node kind. Tagged nodes (`!$include`, `!$map`,
//!   `!Ref`, ...) are interpreted as a small embedded language; mappings under
//!   a `Resources` key whose `Type` names a template in scope are expanded
//!   with parameter validation and name prefixing.
//! - **Assembly** ([`transform`]): hoisted global sections (`Parameters`,
//!   `Outputs`, ...) are merged into the root, provenance metadata is
//!   stamped, and the reserved meta-keys are stripped.
//!
//! # Document Language
//!
//! Documents may use the reserved meta-keys `$imports`, `$defs` and `$params`
//! together with the tag set handled by the evaluator:
//!
//! ```yaml
//! $defs:
//!   env: production
//! $imports:
//!   network: ./network.yaml
//!
//! Resources:
//!   api:
//!     Type: !$include network.ServiceTemplate
//!     Properties:
//!       Stage: "{{env}}"
//! ```
//!
//! # Entry Points
//!
//! [`transform::transform`] resolves imports with the built-in loader;
//! [`transform::transform_with_loader`] accepts any [`loader::Loader`]
//! implementation and is the seam used by the test suite.
//!
//! The CLI surface and any interaction with the downstream control-plane API
//! live outside this crate.

// Document model and codec
pub mod codec;
pub mod values;

// Import loading
pub mod imports;
pub mod loader;
pub mod location;

// Evaluation
pub mod evaluator;
pub mod expander;
pub mod templating;

// Pipeline entry points
pub mod transform;

// Shared error types and constants
pub mod core;

#[cfg(test)]
pub mod test_utils;

pub use crate::core::TransformError;
pub use crate::loader::{DefaultLoader, LoadedImport, Loader};
pub use crate::transform::{transform, transform_with_loader};
