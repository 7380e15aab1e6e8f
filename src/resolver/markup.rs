//! Download-link extraction from mirror page markup.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::catalog::SourceKind;

#[allow(clippy::expect_used)]
static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a\s*>").expect("anchor regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static HREF_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bhref\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("href regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static CLASS_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bclass\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("class regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static COUNTDOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<span\b[^>]*\bclass\s*=\s*["'][^"']*\bjs-partner-countdown\b[^"']*["'][^>]*>\s*(\d+)\s*</span\s*>"#)
        .expect("countdown regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]*>").expect("tag regex is valid") // Static pattern, safe to panic
});

const ZLIB_DOWNLOAD_CLASS: &str = "addDownloadedBook";
const PARTNER_DOWNLOAD_TEXT: &str = "download now";
const MIRROR_DOWNLOAD_TEXT: &str = "GET";

/// What a page offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Absolute download URL.
    Link(String),
    /// A countdown gate; come back after this long.
    Countdown(Duration),
    /// Nothing usable on the page.
    Nothing,
}

/// Finds the download link (or countdown gate) in a fetched page.
pub trait LinkExtractor: Send + Sync {
    fn extract(&self, page_url: &str, markup: &str) -> Extraction;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Anchor {
    href: String,
    class: String,
    text: String,
}

/// Regex-based extractor for the mirror page layouts in the wild.
///
/// - Z-Library pages: the anchor classed `addDownloadedBook`
/// - Partner pages: the anchor reading "Download now", else a
///   `js-partner-countdown` gate
/// - Everything else: the anchor reading exactly "GET"
///
/// When the layout-specific rule finds nothing the other rules are tried, so
/// a mirror that changes layout still resolves.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkupLinkExtractor;

impl MarkupLinkExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LinkExtractor for MarkupLinkExtractor {
    fn extract(&self, page_url: &str, markup: &str) -> Extraction {
        let anchors = parse_anchors(markup);
        let by_class = || find_by_class(&anchors, ZLIB_DOWNLOAD_CLASS);
        let by_partner_text = || {
            anchors
                .iter()
                .find(|a| a.text.to_lowercase().contains(PARTNER_DOWNLOAD_TEXT))
        };
        let by_mirror_text = || {
            anchors
                .iter()
                .find(|a| a.text.eq_ignore_ascii_case(MIRROR_DOWNLOAD_TEXT))
        };

        let found = match SourceKind::classify(page_url) {
            SourceKind::ZLib => by_class().or_else(by_partner_text).or_else(by_mirror_text),
            SourceKind::Partner => by_partner_text().or_else(by_class).or_else(by_mirror_text),
            _ => by_mirror_text().or_else(by_partner_text).or_else(by_class),
        };

        if let Some(anchor) = found {
            return absolutize(page_url, &anchor.href).map_or(Extraction::Nothing, Extraction::Link);
        }

        COUNTDOWN
            .captures(markup)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .map_or(Extraction::Nothing, |secs| {
                Extraction::Countdown(Duration::from_secs(secs))
            })
    }
}

fn parse_anchors(markup: &str) -> Vec<Anchor> {
    ANCHOR
        .captures_iter(markup)
        .filter_map(|captures| {
            let attrs = captures.get(1)?.as_str();
            let href = attr_value(&HREF_ATTR, attrs)?;
            let class = attr_value(&CLASS_ATTR, attrs).unwrap_or_default();
            let inner = captures.get(2).map_or("", |m| m.as_str());
            let text = decode_entities(TAG.replace_all(inner, " ").trim())
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            Some(Anchor {
                href: decode_entities(&href),
                class,
                text,
            })
        })
        .collect()
}

fn attr_value(pattern: &Regex, attrs: &str) -> Option<String> {
    let captures = pattern.captures(attrs)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str().trim().to_string())
}

fn find_by_class<'a>(anchors: &'a [Anchor], class: &str) -> Option<&'a Anchor> {
    anchors
        .iter()
        .find(|a| a.class.split_whitespace().any(|c| c == class))
}

fn decode_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

/// Joins a possibly relative href against the page it came from.
fn absolutize(page_url: &str, href: &str) -> Option<String> {
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }
    let base = Url::parse(page_url).ok()?;
    let joined = base.join(href).ok()?;
    matches!(joined.scheme(), "http" | "https").then(|| joined.to_string())
}
