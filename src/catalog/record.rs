//! Book record and search filter types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Extension used when a record carries no usable format.
pub const FALLBACK_EXTENSION: &str = "bin";

/// Descriptive data for one book plus the ordered links it can be fetched from.
///
/// Only `size` (expected-size hint) and `format` (default file extension)
/// influence retrieval. Everything else is carried for display. Source-specific
/// keys that have no fixed field land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRecord {
    /// Stable identifier, unique within a catalog.
    pub id: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub language: Option<String>,
    /// File format as advertised by the source (`epub`, `pdf`, ...).
    pub format: Option<String>,
    /// Human size hint such as `"1.5 MB"`.
    pub size: Option<String>,
    /// Cover or preview image URL.
    pub preview: Option<String>,
    /// Candidate links in source order.
    #[serde(default)]
    pub download_urls: Vec<String>,
    /// Open-ended source-specific fields (ISBNs, series, edition, ...).
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl BookRecord {
    /// Creates a record with only an identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Builder-style setter for candidate links.
    #[must_use]
    pub fn with_links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.download_urls = links.into_iter().map(Into::into).collect();
        self
    }

    /// Title for logs and progress output; falls back to the id.
    #[must_use]
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(&self.id)
    }

    /// Lowercase file extension derived from `format`.
    #[must_use]
    pub fn file_extension(&self) -> String {
        self.format
            .as_deref()
            .map(|format| format.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
    }
}

/// Optional narrowing applied to catalog searches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Accepted formats, matched case-insensitively. Empty accepts all.
    #[serde(default)]
    pub formats: Vec<String>,
    /// Accepted languages, matched case-insensitively. Empty accepts all.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Substring the author must contain.
    pub author: Option<String>,
}

impl SearchFilters {
    /// Returns true when `record` passes every configured filter.
    #[must_use]
    pub fn matches(&self, record: &BookRecord) -> bool {
        let listed = |accepted: &[String], value: Option<&str>| {
            accepted.is_empty()
                || value.is_some_and(|value| {
                    accepted
                        .iter()
                        .any(|candidate| candidate.eq_ignore_ascii_case(value.trim()))
                })
        };
        let author_ok = self.author.as_deref().is_none_or(|needle| {
            record
                .author
                .as_deref()
                .is_some_and(|author| contains_ignore_case(author, needle))
        });
        listed(&self.formats, record.format.as_deref())
            && listed(&self.languages, record.language.as_deref())
            && author_ok
    }
}

pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_lowercase()
        .contains(needle.trim().to_lowercase().as_str())
}
