//! Tracing/logging setup shared by jobguard binaries.

/// Initialize process-wide tracing with the format named by `JOBGUARD_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use crate::tracing::{LogFormat, init_with};
