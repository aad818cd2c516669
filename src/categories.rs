//! Category mapper.
//!
//! Translates the internal stonks category taxonomy (slash-delimited keys
//! such as `smartphones/samsung`) into Allegro numeric category ids. The
//! table is plain data: a default copy is compiled in from
//! `categories.toml` and an external file can replace it at startup.
//!
//! Lookups are exact. There is no normalisation or fuzzy matching; a missing
//! key is the only failure mode.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use tracing::info;

use crate::types::WatcherError;

/// The table shipped with the binary.
const BUILTIN_TABLE: &str = include_str!("categories.toml");

#[derive(Debug, Deserialize)]
struct CategoryFile {
    categories: HashMap<String, u64>,
}

/// Immutable internal-key → marketplace-id lookup table.
#[derive(Debug, Clone)]
pub struct CategoryMapper {
    table: HashMap<String, u64>,
}

impl CategoryMapper {
    /// The compiled-in default table.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_TABLE).context("Built-in category table is malformed")
    }

    /// Load a table from a TOML file with a `[categories]` section.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read category table: {path}"))?;
        let mapper = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse category table: {path}"))?;
        info!(path, categories = mapper.len(), "Category table loaded");
        Ok(mapper)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: CategoryFile = toml::from_str(contents)?;
        Ok(Self { table: file.categories })
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, u64)>,
        K: Into<String>,
    {
        Self {
            table: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Map an internal category key to the marketplace category id.
    pub fn map(&self, key: &str) -> Result<u64, WatcherError> {
        self.table
            .get(key)
            .copied()
            .ok_or_else(|| WatcherError::UnknownCategory(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
