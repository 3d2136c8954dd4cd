use std::time::Instant;

use super::adapter::AdapterRef;
use super::types::{SandboxConfig, SandboxId, SandboxMetadata};

/// Provider-agnostic reference to one sandbox.
///
/// Holds no connection and no provider resources; it is only an id bound to
/// the adapter that owns it. After `terminate` the value may linger but the
/// adapter decides what further calls do with it.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    id: SandboxId,
    adapter: AdapterRef,
    config: SandboxConfig,
    metadata: SandboxMetadata,
    /// Diagnostics only.
    created_at: Instant,
}

impl SandboxHandle {
    pub(crate) fn new(
        id: SandboxId,
        adapter: AdapterRef,
        config: SandboxConfig,
        metadata: SandboxMetadata,
    ) -> Self {
        Self {
            id,
            adapter,
            config,
            metadata,
            created_at: Instant::now(),
        }
    }

    /// Rehydrate a handle for a sandbox that already exists. No I/O.
    pub fn from_id(adapter: impl Into<AdapterRef>, id: impl Into<SandboxId>) -> Self {
        Self::with_config(adapter, id, SandboxConfig::default())
    }

    pub fn with_config(
        adapter: impl Into<AdapterRef>,
        id: impl Into<SandboxId>,
        config: impl Into<SandboxConfig>,
    ) -> Self {
        Self::new(
            id.into(),
            adapter.into(),
            config.into(),
            SandboxMetadata::default(),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter(&self) -> &AdapterRef {
        &self.adapter
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}
