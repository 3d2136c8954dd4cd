pub mod adapter;
pub mod backends;
pub mod error;
pub mod handle;
pub mod local_host;
pub mod runtime;
pub mod types;

pub use adapter::{AdapterRef, SandboxAdapter};
pub use error::SandboxError;
pub use handle::SandboxHandle;
pub use runtime::{CallContext, SandboxRuntime, SandboxRuntimeBuilder};
pub use types::*;

use crate::config::Config;
use backends::local_host::{LocalHostAdapter, LocalHostConfig};
use backends::memory::InMemoryAdapter;

impl SandboxRuntime {
    /// Runtime with the built-in adapters: `memory` and `local`.
    pub fn from_config(config: &Config) -> Result<Self, SandboxError> {
        tracing::info!(
            sandbox_root = %config.sandbox_root.display(),
            "initializing local sandbox adapter"
        );
        let mut local = LocalHostConfig::new(&config.sandbox_root);
        local.max_output_bytes = config.max_output_bytes;

        Ok(Self::builder()
            .register(InMemoryAdapter::new())
            .register(LocalHostAdapter::new(local)?)
            .build())
    }
}
