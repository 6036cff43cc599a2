//! Process-wide logging setup shared by commander binaries.

/// Initialize tracing for the process from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filter, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};
