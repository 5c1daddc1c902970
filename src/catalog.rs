use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::Result;

/// A catalog record. Everything besides `name` is owned by the storage layer
/// and carried through untouched (composition, dosage, warnings, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

pub trait CatalogLookup {
    /// All entries whose name starts with `name`. An empty vec means no match.
    fn lookup_by_prefix(&self, name: &str) -> Result<Vec<CatalogEntry>>;
}

/// Case-insensitive prefix search over entries kept in insertion order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: Vec<CatalogEntry>,
}

impl InMemoryCatalog {
    pub fn new(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Reads a JSON array of entries.
    #[instrument(level = "debug")]
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let entries: Vec<CatalogEntry> = serde_json::from_str(&contents)
            .map_err(|err| crate::Error::configuration(format!("catalog {path:?}: {err}")))?;
        log::debug!("Loaded {} catalog entries from {path:?}", entries.len());
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CatalogLookup for InMemoryCatalog {
    fn lookup_by_prefix(&self, name: &str) -> Result<Vec<CatalogEntry>> {
        let prefix = name.to_lowercase();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.name.to_lowercase().starts_with(&prefix))
            .cloned()
            .collect())
    }
}
