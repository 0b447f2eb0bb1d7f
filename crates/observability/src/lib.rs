//! Process-wide tracing setup shared by the binaries.

/// Initialize process-wide tracing with the format picked by `UNIPUBSUB_LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formats).
pub mod tracing;
