use std::path::PathBuf;

use crate::script::{DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_TIMEOUT_MS};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub script_timeout_ms: u64,
    pub script_memory_limit_bytes: usize,
    pub sandbox_root: PathBuf,
    pub max_output_bytes: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("WARDEN_SCRIPT_TIMEOUT_MS").ok().as_deref(),
            std::env::var("WARDEN_SCRIPT_MEMORY_LIMIT").ok().as_deref(),
            std::env::var("WARDEN_SANDBOX_ROOT").ok().as_deref(),
            std::env::var("WARDEN_MAX_OUTPUT_BYTES").ok().as_deref(),
        )
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        script_timeout_ms: Option<&str>,
        script_memory_limit: Option<&str>,
        sandbox_root: Option<&str>,
        max_output_bytes: Option<&str>,
    ) -> Self {
        // Zero would mean "no bound"; fall back to the default instead.
        let script_timeout_ms = script_timeout_ms
            .and_then(|v| v.parse().ok())
            .filter(|ms: &u64| *ms > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let script_memory_limit_bytes = script_memory_limit
            .and_then(|v| v.parse().ok())
            .filter(|bytes: &usize| *bytes > 0)
            .unwrap_or(DEFAULT_MEMORY_LIMIT_BYTES);

        let sandbox_root = sandbox_root
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_sandbox_root);

        let max_output_bytes = max_output_bytes
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);

        Config {
            script_timeout_ms,
            script_memory_limit_bytes,
            sandbox_root,
            max_output_bytes,
        }
    }
}

fn default_sandbox_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("warden")
        .join("sandboxes")
}
