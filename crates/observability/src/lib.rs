//! Tracing setup shared by jobforge binaries.

/// Tracing subscriber configuration (filter, output format).
pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize process-wide tracing.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}
