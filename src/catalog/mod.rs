//! Book metadata lookup and candidate link ordering.
//!
//! - [`Catalog`] - async trait the core calls for search and detail lookups
//! - [`StaticCatalog`] - in-memory catalog backed by a JSON manifest
//! - [`BookRecord`] - structured book metadata with an open-ended `extra` map
//! - [`SourcePreference`] - static preference order for candidate links

mod memory;
mod preference;
mod record;

pub use memory::StaticCatalog;
pub use preference::{BOOK_EXTENSIONS, SourceKind, SourcePreference, has_book_extension};
pub use record::{BookRecord, FALLBACK_EXTENSION, SearchFilters};

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by catalog implementations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The manifest could not be read.
    #[error("failed to read catalog manifest {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not a JSON array of book records.
    #[error("invalid catalog manifest: {source}\n  Suggestion: provide a JSON array of objects with at least an \"id\" field")]
    Manifest {
        #[source]
        source: serde_json::Error,
    },

    /// The backing source could not be queried.
    #[error("catalog unavailable: {message}")]
    Unavailable { message: String },
}

/// Metadata source consulted for search and for refreshing candidate links.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Searches for books matching `query` and `filters`.
    async fn lookup_sources(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<BookRecord>, CatalogError>;

    /// Fetches full details, including candidate links, for one book.
    async fn get_details(&self, id: &str) -> Result<Option<BookRecord>, CatalogError>;
}
