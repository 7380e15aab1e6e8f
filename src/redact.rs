//! Masks credentials embedded in links before they reach logs or diagnostics.

use std::sync::LazyLock;

use regex::Regex;

#[allow(clippy::expect_used)]
static SECRET_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([?&](?:key|token|secret|password)=)[^&#]*").expect("secret regex is valid") // Static pattern, safe to panic
});

/// Replaces the value of credential-like query parameters with `***`.
#[must_use]
pub fn redact_link(link: &str) -> String {
    SECRET_PARAM.replace_all(link, "${1}***").into_owned()
}
