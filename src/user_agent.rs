//! User-Agent strings for transfer and page-fetch HTTP clients.

/// Project URL advertised in the User-Agent.
const PROJECT_UA_URL: &str = "https://github.com/fierce/bookdl";

/// Browser User-Agent sent to mirror pages, most of which refuse obvious bots.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// User-Agent for file transfers (identifies the tool).
#[must_use]
pub(crate) fn default_transfer_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("bookdl/{version} (+{PROJECT_UA_URL})")
}

/// User-Agent for page and API fetches during resolution.
#[must_use]
pub(crate) fn default_page_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_ua_carries_crate_version() {
        let ua = default_transfer_user_agent();
        assert_eq!(
            ua.strip_prefix("bookdl/")
                .and_then(|rest| rest.split(' ').next()),
            Some(env!("CARGO_PKG_VERSION"))
        );
        assert!(ua.contains(PROJECT_UA_URL));
    }

    #[test]
    fn test_page_ua_looks_like_browser() {
        assert!(default_page_user_agent().starts_with("Mozilla/5.0"));
    }
}
