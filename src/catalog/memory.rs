//! In-memory catalog backed by a list of records.

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::record::contains_ignore_case;
use super::{BookRecord, Catalog, CatalogError, SearchFilters};

/// Catalog over a fixed set of records, typically loaded from a manifest.
///
/// Records with an empty id are dropped on construction. When ids repeat the
/// first record wins.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    records: Vec<BookRecord>,
}

impl StaticCatalog {
    #[must_use]
    pub fn from_records(records: Vec<BookRecord>) -> Self {
        let mut kept: Vec<BookRecord> = Vec::with_capacity(records.len());
        for record in records {
            if record.id.trim().is_empty() {
                warn!(title = record.display_title(), "dropping record without id");
                continue;
            }
            if kept.iter().any(|existing| existing.id == record.id) {
                warn!(id = %record.id, "dropping duplicate record");
                continue;
            }
            kept.push(record);
        }
        Self { records: kept }
    }

    /// Parses a JSON array of records.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Manifest`] when the text is not a JSON array of
    /// book records.
    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let records: Vec<BookRecord> =
            serde_json::from_str(text).map_err(|source| CatalogError::Manifest { source })?;
        Ok(Self::from_records(records))
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Io`] if the file cannot be read and
    /// [`CatalogError::Manifest`] if it does not parse.
    #[instrument(level = "debug", fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json(&text)?;
        debug!(records = catalog.len(), "manifest loaded");
        Ok(catalog)
    }

    #[must_use]
    pub fn records(&self) -> &[BookRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn lookup_sources(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookRecord>, CatalogError> {
        let query = query.trim();
        Ok(self
            .records
            .iter()
            .filter(|record| {
                query.is_empty()
                    || record.id == query
                    || record
                        .title
                        .as_deref()
                        .is_some_and(|title| contains_ignore_case(title, query))
                    || record
                        .author
                        .as_deref()
                        .is_some_and(|author| contains_ignore_case(author, query))
            })
            .filter(|record| filters.matches(record))
            .cloned()
            .collect())
    }

    async fn get_details(&self, id: &str) -> Result<Option<BookRecord>, CatalogError> {
        Ok(self.records.iter().find(|record| record.id == id).cloned())
    }
}
