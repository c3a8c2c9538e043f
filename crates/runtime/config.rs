//! Runtime configuration constants

/// Arena reserved up front for small allocations (16MB)
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Allocations at or above this size bypass the arena and get their own mapping
pub const LARGE_ALLOC_THRESHOLD: usize = 64 * 1024;

/// Default log file path
pub const LOG_FILE_PATH: &[u8] = b"/tmp/edit-bridge.log\0";

/// Socket listen backlog
pub const LISTEN_BACKLOG: i32 = 128;

/// Bytes requested per recv on a connection
pub const READ_CHUNK: usize = 4096;

/// How often the liveness reaper pings every open connection
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;

/// A connection with no pong for this long is considered dead
pub const DEFAULT_PONG_TIMEOUT_MS: u64 = 30_000;
