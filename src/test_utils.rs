//! Shared helpers for unit tests.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_yaml::Value;

use crate::codec::DocFormat;
use crate::core::TransformError;
use crate::loader::{LoadedImport, Loader};
use crate::location::ImportType;

/// An in-memory [`Loader`] keyed by exact location string.
///
/// Relative resolution is deliberately absent: tests spell out the location
/// they expect the walker to ask for, which doubles as an assertion.
#[derive(Debug, Default)]
pub struct MemoryLoader {
    entries: HashMap<String, String>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, location: impl Into<String>, data: impl Into<String>) -> Self {
        self.entries.insert(location.into(), data.into());
        self
    }
}

#[async_trait]
impl Loader for MemoryLoader {
    async fn load(&self, location: &str, _base_location: &str) -> Result<LoadedImport> {
        let Some(data) = self.entries.get(location) else {
            bail!(TransformError::ImportResolution {
                location: location.to_owned(),
                reason: "not present in the test loader".into(),
            });
        };
        let doc = match DocFormat::from_location(location) {
            Some(format) => crate::codec::parse_str(data, format)?,
            None => Value::String(data.clone()),
        };
        Ok(LoadedImport {
            import_type: ImportType::File,
            resolved_location: location.to_owned(),
            data: data.clone(),
            doc,
        })
    }
}
