//! Static source-type ordering applied to candidate links at enqueue time.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Book file extensions recognised as direct downloads.
pub const BOOK_EXTENSIONS: [&str; 10] = [
    "epub", "pdf", "mobi", "azw3", "azw", "fb2", "djvu", "cbz", "cbr", "txt",
];

/// Coarse classification of where a candidate link points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Credentialed fast-download API endpoint.
    FastDownload,
    /// Partner-server intermediary page (may carry a countdown gate).
    Partner,
    /// Library Genesis mirror page.
    Libgen,
    /// Welib mirror page.
    Welib,
    /// Z-Library book page.
    #[serde(rename = "zlib")]
    ZLib,
    /// Link that already points at a book file.
    Direct,
    /// Anything else.
    Other,
}

impl SourceKind {
    /// Classifies a link by URL shape.
    #[must_use]
    pub fn classify(link: &str) -> Self {
        let lower = link.to_ascii_lowercase();
        if lower.contains("fast_download.json") {
            Self::FastDownload
        } else if lower.contains("/slow_download/") {
            Self::Partner
        } else if lower.contains("libgen") {
            Self::Libgen
        } else if lower.contains("welib") {
            Self::Welib
        } else if lower.contains("z-lib") || lower.contains("z-library") {
            Self::ZLib
        } else if has_book_extension(link) {
            Self::Direct
        } else {
            Self::Other
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastDownload => "fast_download",
            Self::Partner => "partner",
            Self::Libgen => "libgen",
            Self::Welib => "welib",
            Self::ZLib => "zlib",
            Self::Direct => "direct",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns true when the URL path ends in a known book extension.
#[must_use]
pub fn has_book_extension(link: &str) -> bool {
    let Ok(parsed) = Url::parse(link) else {
        return false;
    };
    parsed
        .path()
        .rsplit_once('.')
        .is_some_and(|(_, ext)| BOOK_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Ordered list of preferred source kinds.
///
/// Links are stable-sorted by the rank of their kind; kinds missing from the
/// list sort after every listed kind, still in their original relative order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePreference {
    order: Vec<SourceKind>,
}

impl Default for SourcePreference {
    fn default() -> Self {
        Self::new(vec![
            SourceKind::FastDownload,
            SourceKind::Partner,
            SourceKind::Libgen,
            SourceKind::Welib,
            SourceKind::ZLib,
            SourceKind::Direct,
            SourceKind::Other,
        ])
    }
}

impl SourcePreference {
    #[must_use]
    pub fn new(order: Vec<SourceKind>) -> Self {
        Self { order }
    }

    #[must_use]
    pub fn kinds(&self) -> &[SourceKind] {
        &self.order
    }

    fn rank(&self, kind: SourceKind) -> usize {
        self.order
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(self.order.len())
    }

    /// Returns `links` de-duplicated and ordered by preference.
    #[must_use]
    pub fn order(&self, links: &[String]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut unique: Vec<&String> = links
            .iter()
            .filter(|link| !link.trim().is_empty() && seen.insert(link.as_str()))
            .collect();
        unique.sort_by_key(|link| self.rank(SourceKind::classify(link)));
        unique.into_iter().cloned().collect()
    }
}
