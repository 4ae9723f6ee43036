//! Tracing/logging setup shared by the api and worker binaries.

/// Initialize process-wide logging at `info`, JSON formatted.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init("info", true);
}

/// Initialize with an explicit default level and format.
pub fn init_with(default_level: &str, json: bool) {
    tracing::init(default_level, json);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
