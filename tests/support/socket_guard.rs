//! Guards for wiremock tests, which need a bindable localhost socket.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "BOOKDL_REQUIRE_SOCKET_TESTS";

/// What a socket-bound test does when localhost cannot be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnMissingSocket {
    Skip,
    Fail,
}

impl OnMissingSocket {
    #[must_use]
    pub fn from_env() -> Self {
        let required = std::env::var(REQUIRE_ENV)
            .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        if required { Self::Fail } else { Self::Skip }
    }
}

fn localhost_bindable() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// True when the calling test should return early.
///
/// Panics instead when `BOOKDL_REQUIRE_SOCKET_TESTS` is set, so CI cannot
/// silently skip mirror tests.
#[track_caller]
#[must_use]
pub fn should_skip_socket_bound_test() -> bool {
    if localhost_bindable() {
        return false;
    }
    let caller = Location::caller();
    let message = format!(
        "[socket-bound-test] {}:{} needs a localhost socket for its mock mirror",
        caller.file(),
        caller.line()
    );
    match OnMissingSocket::from_env() {
        OnMissingSocket::Fail => panic!("{message}; unset {REQUIRE_ENV} to skip instead"),
        OnMissingSocket::Skip => {
            eprintln!("{message}; skipping (set {REQUIRE_ENV}=1 to fail)");
            true
        }
    }
}

/// Starts a mock mirror, or returns `None` when the test should be skipped.
pub async fn start_mock_server_or_skip() -> Option<MockServer> {
    if should_skip_socket_bound_test() {
        return None;
    }
    Some(MockServer::start().await)
}
