//! Tracing and logging setup shared by the engine binary and tests.

use serde::{Deserialize, Serialize};

/// Log output settings (the `[log]` section of the engine configuration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

/// Initialize process-wide observability with default settings.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Initialize process-wide observability from configuration.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}

/// Tracing subscriber configuration (filters, formatting).
pub mod tracing;
