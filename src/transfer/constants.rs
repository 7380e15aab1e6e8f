//! Transfer defaults.

/// TCP connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Maximum idle time between body reads in seconds.
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Size of the pieces the body is processed in (8 KiB).
pub const CHUNK_SIZE: usize = 8192;

/// Times a body stream may restart from byte zero after an interruption.
pub const DEFAULT_MAX_STREAM_RESTARTS: u32 = 2;

/// A payload below this percentage of the expected size is suspect.
pub const SHORT_PAYLOAD_PERCENT: u64 = 90;
