use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// Contract every sandbox provider implements.
///
/// `create`, `exec`, `terminate` and `status` are required. The rest are
/// optional: an adapter lists the ones it implements in
/// [`AdapterInfo::capabilities`] and overrides the matching methods. The
/// defaults return `SandboxError::Unsupported`, but the runtime checks the
/// descriptor first and never relies on them.
///
/// Adapters document whether concurrent `exec` calls against one sandbox
/// are serialized or interleaved.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Registry name and capability descriptor.
    fn info(&self) -> AdapterInfo;

    async fn create(&self, config: &SandboxConfig) -> Result<Provisioned, SandboxError>;

    async fn exec(
        &self,
        id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult, SandboxError>;

    async fn terminate(&self, id: &str, opts: &TerminateOptions) -> Result<(), SandboxError>;

    /// Query the provider. Errors are reported to callers as `Unknown`.
    async fn status(&self, id: &str, opts: &StatusOptions) -> Result<SandboxStatus, SandboxError>;

    // ── Optional ────────────────────────────────────────────────

    async fn get_url(&self, _id: &str, _port: u16, _opts: &UrlOptions) -> Result<String, SandboxError> {
        Err(self.unsupported(Capability::GetUrl))
    }

    async fn read_file(&self, _id: &str, _path: &str) -> Result<Vec<u8>, SandboxError> {
        Err(self.unsupported(Capability::ReadFile))
    }

    async fn write_file(&self, _id: &str, _path: &str, _contents: &[u8]) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::WriteFile))
    }

    async fn write_files(&self, _id: &str, _files: &[FileWrite]) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::WriteFiles))
    }

    async fn await_ready(&self, _id: &str, _opts: &ReadyOptions) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::AwaitReady))
    }

    async fn update(&self, _id: &str, _config: &SandboxConfig) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::Update))
    }

    async fn stop(&self, _id: &str) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::Stop))
    }

    async fn start(&self, _id: &str) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::Start))
    }

    // ── Checkpoint extension ────────────────────────────────────

    async fn create_checkpoint(
        &self,
        _id: &str,
        _opts: &CheckpointOptions,
    ) -> Result<CheckpointId, SandboxError> {
        Err(self.unsupported(Capability::CreateCheckpoint))
    }

    async fn restore_checkpoint(&self, _id: &str, _checkpoint_id: &str) -> Result<(), SandboxError> {
        Err(self.unsupported(Capability::RestoreCheckpoint))
    }

    async fn list_checkpoints(
        &self,
        _id: &str,
        _opts: &CheckpointOptions,
    ) -> Result<Vec<CheckpointRef>, SandboxError> {
        Err(self.unsupported(Capability::ListCheckpoints))
    }

    #[doc(hidden)]
    fn unsupported(&self, capability: Capability) -> SandboxError {
        SandboxError::Unsupported {
            adapter: self.info().name,
            operation: capability.as_str(),
        }
    }
}

/// An adapter paired with its capability descriptor.
///
/// `info()` is called once, when the reference is built. Handles clone the
/// reference, so every handle bound to the same adapter shares one
/// descriptor.
#[derive(Clone)]
pub struct AdapterRef {
    adapter: Arc<dyn SandboxAdapter>,
    info: Arc<AdapterInfo>,
}

impl AdapterRef {
    pub fn new(adapter: Arc<dyn SandboxAdapter>) -> Self {
        let info = Arc::new(adapter.info());
        Self { adapter, info }
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.info.capabilities.supports(capability)
    }

    pub(crate) fn adapter(&self) -> &dyn SandboxAdapter {
        self.adapter.as_ref()
    }
}

impl<A: SandboxAdapter + 'static> From<Arc<A>> for AdapterRef {
    fn from(adapter: Arc<A>) -> Self {
        Self::new(adapter)
    }
}

impl fmt::Debug for AdapterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRef")
            .field("name", &self.info.name)
            .field("capabilities", &self.info.capabilities)
            .finish()
    }
}
