//! Parsing of human-readable size hints ("1.5 MB", "700kb", "2,3 GB").

use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::expect_used)]
static SIZE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*([0-9]+(?:[.,][0-9]+)?)\s*(bytes?|b|k|kb|kib|m|mb|mib|g|gb|gib|t|tb|tib)?\s*$")
        .expect("size hint regex is valid") // Static pattern, safe to panic
});

/// Converts a size hint to bytes. Units are binary (1 KB = 1024 bytes); a bare
/// number is bytes. Returns `None` for anything unparseable or zero.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn parse_size_hint(hint: &str) -> Option<u64> {
    let captures = SIZE_HINT.captures(hint)?;
    let number: f64 = captures.get(1)?.as_str().replace(',', ".").parse().ok()?;
    let unit = captures
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_default();
    let multiplier: u64 = match unit.chars().next() {
        None | Some('b') => 1,
        Some('k') => 1 << 10,
        Some('m') => 1 << 20,
        Some('g') => 1 << 30,
        Some('t') => 1 << 40,
        Some(_) => return None,
    };
    let bytes = (number * multiplier as f64).round();
    (bytes >= 1.0 && bytes < u64::MAX as f64).then_some(bytes as u64)
}
