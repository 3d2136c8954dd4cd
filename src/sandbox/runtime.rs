//! The facade agents call.
//!
//! `SandboxRuntime` resolves which adapter backs a handle, checks the
//! adapter's capability descriptor for optional operations and forwards
//! the call. It keeps no per-sandbox state and performs no retries; the
//! adapter registry is fixed once the runtime is built.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use super::adapter::{AdapterRef, SandboxAdapter};
use super::error::SandboxError;
use super::handle::SandboxHandle;
use super::types::*;

/// Call-scoped bookkeeping, passed explicitly through each dispatch.
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub operation: &'static str,
    pub started: Instant,
}

impl CallContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

#[derive(Default)]
pub struct SandboxRuntimeBuilder {
    adapters: BTreeMap<&'static str, AdapterRef>,
}

impl SandboxRuntimeBuilder {
    /// Register an adapter under its `info().name`. A later registration
    /// with the same name replaces the earlier one.
    pub fn register<A: SandboxAdapter + 'static>(self, adapter: A) -> Self {
        self.register_ref(AdapterRef::new(Arc::new(adapter)))
    }

    pub fn register_ref(mut self, adapter: AdapterRef) -> Self {
        tracing::debug!(adapter = adapter.name(), "registering sandbox adapter");
        self.adapters.insert(adapter.name(), adapter);
        self
    }

    pub fn build(self) -> SandboxRuntime {
        SandboxRuntime {
            adapters: Arc::new(self.adapters),
        }
    }
}

/// Stateless dispatcher over a fixed set of adapters. Cheap to clone.
#[derive(Clone)]
pub struct SandboxRuntime {
    adapters: Arc<BTreeMap<&'static str, AdapterRef>>,
}

impl SandboxRuntime {
    pub fn builder() -> SandboxRuntimeBuilder {
        SandboxRuntimeBuilder::default()
    }

    pub fn adapter(&self, selector: &str) -> Result<&AdapterRef, SandboxError> {
        self.adapters
            .get(selector)
            .ok_or_else(|| SandboxError::UnknownAdapter(selector.to_string()))
    }

    pub fn adapter_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.adapters.keys().copied()
    }

    // ── Required operations ─────────────────────────────────────

    /// Provision a sandbox on the adapter registered as `selector`.
    /// Adapter errors come back unchanged.
    pub async fn create(
        &self,
        selector: &str,
        config: impl Into<SandboxConfig>,
    ) -> Result<SandboxHandle, SandboxError> {
        let ctx = CallContext::new("create");
        let adapter = self.adapter(selector)?.clone();
        let config = config.into();

        let provisioned = dispatch(ctx, adapter.name(), "-", adapter.adapter().create(&config)).await?;
        tracing::info!(
            adapter = adapter.name(),
            sandbox_id = %provisioned.id,
            "sandbox created"
        );
        Ok(SandboxHandle::new(
            provisioned.id,
            adapter,
            config,
            provisioned.metadata,
        ))
    }

    /// Rebuild a handle for a sandbox known to exist. No I/O.
    pub fn from_id(
        &self,
        selector: &str,
        id: impl Into<SandboxId>,
        config: impl Into<SandboxConfig>,
    ) -> Result<SandboxHandle, SandboxError> {
        let adapter = self.adapter(selector)?.clone();
        Ok(SandboxHandle::with_config(adapter, id, config))
    }

    /// May block for as long as the provider takes to run `command`.
    pub async fn exec(
        &self,
        handle: &SandboxHandle,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        let ctx = CallContext::new("exec");
        let adapter = handle.adapter();
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().exec(handle.id(), command, opts)).await
    }

    pub async fn terminate(
        &self,
        handle: &SandboxHandle,
        opts: &TerminateOptions,
    ) -> Result<(), SandboxError> {
        let ctx = CallContext::new("terminate");
        let adapter = handle.adapter();
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().terminate(handle.id(), opts)).await?;
        tracing::info!(adapter = adapter.name(), sandbox_id = %handle.id(), "sandbox terminated");
        Ok(())
    }

    /// Always re-queries the provider. A provider that cannot answer
    /// yields `Unknown`, never `Terminated`.
    pub async fn status(&self, handle: &SandboxHandle, opts: &StatusOptions) -> SandboxStatus {
        let ctx = CallContext::new("status");
        let adapter = handle.adapter();
        match dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().status(handle.id(), opts)).await {
            Ok(status) => status,
            Err(_) => SandboxStatus::Unknown,
        }
    }

    // ── Optional operations ─────────────────────────────────────

    pub async fn get_url(
        &self,
        handle: &SandboxHandle,
        port: u16,
        opts: &UrlOptions,
    ) -> Result<String, SandboxError> {
        let adapter = require(handle, Capability::GetUrl)?;
        let ctx = CallContext::new("get_url");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().get_url(handle.id(), port, opts)).await
    }

    pub async fn read_file(&self, handle: &SandboxHandle, path: &str) -> Result<Vec<u8>, SandboxError> {
        let adapter = require(handle, Capability::ReadFile)?;
        let ctx = CallContext::new("read_file");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().read_file(handle.id(), path)).await
    }

    pub async fn write_file(
        &self,
        handle: &SandboxHandle,
        path: &str,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::WriteFile)?;
        let ctx = CallContext::new("write_file");
        let fut = adapter.adapter().write_file(handle.id(), path, contents.as_ref());
        dispatch(ctx, adapter.name(), handle.id(), fut).await
    }

    pub async fn write_files(&self, handle: &SandboxHandle, files: &[FileWrite]) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::WriteFiles)?;
        let ctx = CallContext::new("write_files");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().write_files(handle.id(), files)).await
    }

    pub async fn await_ready(&self, handle: &SandboxHandle, opts: &ReadyOptions) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::AwaitReady)?;
        let ctx = CallContext::new("await_ready");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().await_ready(handle.id(), opts)).await
    }

    pub async fn update(
        &self,
        handle: &SandboxHandle,
        config: impl Into<SandboxConfig>,
    ) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::Update)?;
        let ctx = CallContext::new("update");
        let config = config.into();
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().update(handle.id(), &config)).await
    }

    pub async fn stop(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::Stop)?;
        let ctx = CallContext::new("stop");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().stop(handle.id())).await
    }

    pub async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::Start)?;
        let ctx = CallContext::new("start");
        dispatch(ctx, adapter.name(), handle.id(), adapter.adapter().start(handle.id())).await
    }

    // ── Checkpoint extension ────────────────────────────────────

    pub async fn create_checkpoint(
        &self,
        handle: &SandboxHandle,
        opts: &CheckpointOptions,
    ) -> Result<CheckpointId, SandboxError> {
        let adapter = require(handle, Capability::CreateCheckpoint)?;
        let ctx = CallContext::new("create_checkpoint");
        let fut = adapter.adapter().create_checkpoint(handle.id(), opts);
        dispatch(ctx, adapter.name(), handle.id(), fut).await
    }

    pub async fn restore_checkpoint(
        &self,
        handle: &SandboxHandle,
        checkpoint_id: &str,
    ) -> Result<(), SandboxError> {
        let adapter = require(handle, Capability::RestoreCheckpoint)?;
        let ctx = CallContext::new("restore_checkpoint");
        let fut = adapter.adapter().restore_checkpoint(handle.id(), checkpoint_id);
        dispatch(ctx, adapter.name(), handle.id(), fut).await
    }

    pub async fn list_checkpoints(
        &self,
        handle: &SandboxHandle,
        opts: &CheckpointOptions,
    ) -> Result<Vec<CheckpointRef>, SandboxError> {
        let adapter = require(handle, Capability::ListCheckpoints)?;
        let ctx = CallContext::new("list_checkpoints");
        let fut = adapter.adapter().list_checkpoints(handle.id(), opts);
        dispatch(ctx, adapter.name(), handle.id(), fut).await
    }
}

/// Fail locally, before any provider call, when the capability is missing.
fn require(handle: &SandboxHandle, capability: Capability) -> Result<&AdapterRef, SandboxError> {
    let adapter = handle.adapter();
    if adapter.supports(capability) {
        Ok(adapter)
    } else {
        tracing::debug!(
            adapter = adapter.name(),
            operation = capability.as_str(),
            "optional operation not supported"
        );
        Err(SandboxError::Unsupported {
            adapter: adapter.name(),
            operation: capability.as_str(),
        })
    }
}

async fn dispatch<T>(
    ctx: CallContext,
    adapter: &'static str,
    sandbox_id: &str,
    fut: impl Future<Output = Result<T, SandboxError>>,
) -> Result<T, SandboxError> {
    let result = fut.await;
    match &result {
        Ok(_) => tracing::debug!(
            adapter,
            sandbox_id,
            operation = ctx.operation,
            elapsed_ms = ctx.elapsed_ms() as u64,
            "sandbox call completed"
        ),
        Err(e) => tracing::warn!(
            adapter,
            sandbox_id,
            operation = ctx.operation,
            elapsed_ms = ctx.elapsed_ms() as u64,
            error = %e,
            "sandbox call failed"
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::memory::InMemoryAdapter;
    use serde_json::json;

    fn runtime_with(adapter: Arc<InMemoryAdapter>) -> SandboxRuntime {
        SandboxRuntime::builder()
            .register_ref(AdapterRef::new(adapter))
            .build()
    }

    fn runtime() -> (Arc<InMemoryAdapter>, SandboxRuntime) {
        let adapter = Arc::new(InMemoryAdapter::new());
        (adapter.clone(), runtime_with(adapter))
    }

    #[tokio::test]
    async fn create_then_status_is_running() {
        let (_, rt) = runtime();
        let handle = rt.create("memory", vec![("image", json!("alpine"))]).await.unwrap();
        assert!(!handle.id().is_empty());
        assert_eq!(handle.config().get("image"), Some(&json!("alpine")));
        assert_eq!(rt.status(&handle, &StatusOptions::default()).await, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn terminate_then_status_is_terminated() {
        let (_, rt) = runtime();
        let handle = rt.create("memory", SandboxConfig::new()).await.unwrap();
        rt.terminate(&handle, &TerminateOptions::default()).await.unwrap();
        assert_eq!(
            rt.status(&handle, &StatusOptions::default()).await,
            SandboxStatus::Terminated
        );
    }

    #[tokio::test]
    async fn unknown_selector_fails() {
        let (_, rt) = runtime();
        let err = rt.create("docker", SandboxConfig::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::UnknownAdapter(ref s) if s == "docker"));
    }

    #[tokio::test]
    async fn from_id_builds_without_io() {
        let (adapter, rt) = runtime();
        let handle = rt.from_id("memory", "x", SandboxConfig::new()).unwrap();
        assert_eq!(handle.id(), "x");
        assert!(handle.config().is_empty());
        assert_eq!(adapter.call_count(), 0);

        let direct = SandboxHandle::from_id(adapter.clone(), "x");
        assert_eq!(direct.id(), "x");
        assert!(direct.config().is_empty());
        assert_eq!(adapter.call_count(), 0);
    }

    #[tokio::test]
    async fn status_of_unreachable_sandbox_is_unknown() {
        let (_, rt) = runtime();
        let handle = rt.from_id("memory", "never-created", SandboxConfig::new()).unwrap();
        assert_eq!(rt.status(&handle, &StatusOptions::default()).await, SandboxStatus::Unknown);
    }

    #[tokio::test]
    async fn exec_passes_provider_errors_through() {
        let (_, rt) = runtime();
        let handle = rt.from_id("memory", "ghost", SandboxConfig::new()).unwrap();
        let err = rt.exec(&handle, "ls", &ExecOptions::default()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(ref id) if id == "ghost"));
        assert!(!err.is_unsupported());
    }

    #[tokio::test]
    async fn missing_capability_is_unsupported_and_skips_provider() {
        let adapter = Arc::new(InMemoryAdapter::new().with_capabilities(
            AdapterCapabilities::none().with(Capability::ReadFile),
        ));
        let rt = runtime_with(adapter.clone());
        let handle = rt.create("memory", SandboxConfig::new()).await.unwrap();
        let calls_before = adapter.call_count();

        let err = rt.write_file(&handle, "/a.txt", b"data").await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(matches!(
            err,
            SandboxError::Unsupported { adapter: "memory", operation: "write_file" }
        ));

        for err in [
            rt.stop(&handle).await.unwrap_err(),
            rt.start(&handle).await.unwrap_err(),
            rt.get_url(&handle, 8080, &UrlOptions::default()).await.unwrap_err(),
            rt.update(&handle, SandboxConfig::new()).await.unwrap_err(),
            rt.await_ready(&handle, &ReadyOptions::default()).await.unwrap_err(),
            rt.write_files(&handle, &[]).await.unwrap_err(),
            rt.create_checkpoint(&handle, &CheckpointOptions::default()).await.unwrap_err(),
            rt.restore_checkpoint(&handle, "cp").await.unwrap_err(),
            rt.list_checkpoints(&handle, &CheckpointOptions::default()).await.unwrap_err(),
        ] {
            assert!(err.is_unsupported(), "expected unsupported, got {err}");
        }
        assert_eq!(adapter.call_count(), calls_before);

        // Supported optional op still reaches the provider, and fails there.
        let err = rt.read_file(&handle, "/missing").await.unwrap_err();
        assert!(!err.is_unsupported());
        assert_eq!(adapter.call_count(), calls_before + 1);
    }

    #[tokio::test]
    async fn optional_operations_forward_when_supported() {
        let (_, rt) = runtime();
        let handle = rt.create("memory", SandboxConfig::new()).await.unwrap();

        rt.write_file(&handle, "/notes.txt", "hello").await.unwrap();
        assert_eq!(rt.read_file(&handle, "/notes.txt").await.unwrap(), b"hello");

        rt.stop(&handle).await.unwrap();
        assert_eq!(rt.status(&handle, &StatusOptions::default()).await, SandboxStatus::Stopped);
        rt.start(&handle).await.unwrap();
        assert_eq!(rt.status(&handle, &StatusOptions::default()).await, SandboxStatus::Running);

        let url = rt.get_url(&handle, 3000, &UrlOptions::default()).await.unwrap();
        assert!(url.contains(handle.id()));
        assert!(url.ends_with(":3000"));
    }

    #[tokio::test]
    async fn checkpoint_roundtrip_through_runtime() {
        let (_, rt) = runtime();
        let handle = rt.create("memory", SandboxConfig::new()).await.unwrap();
        rt.write_file(&handle, "/state", "v1").await.unwrap();
        let cp = rt
            .create_checkpoint(&handle, &CheckpointOptions { name: Some("before".into()) })
            .await
            .unwrap();
        rt.write_file(&handle, "/state", "v2").await.unwrap();
        rt.restore_checkpoint(&handle, &cp).await.unwrap();
        assert_eq!(rt.read_file(&handle, "/state").await.unwrap(), b"v1");

        let list = rt.list_checkpoints(&handle, &CheckpointOptions::default()).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name.as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn concurrent_exec_on_one_handle() {
        let (_, rt) = runtime();
        let handle = rt.create("memory", SandboxConfig::new()).await.unwrap();
        let opts = ExecOptions::default();
        let calls = (0..8).map(|i| {
            let rt = rt.clone();
            let handle = handle.clone();
            let opts = opts.clone();
            async move { rt.exec(&handle, &format!("echo {i}"), &opts).await }
        });
        let results = futures::future::join_all(calls).await;
        for (i, r) in results.into_iter().enumerate() {
            assert_eq!(r.unwrap().stdout, format!("echo {i}"));
        }
    }

    #[test]
    fn call_context_measures_elapsed() {
        let ctx = CallContext::new("exec");
        assert_eq!(ctx.operation, "exec");
        assert!(ctx.elapsed_ms() < 60_000);
    }
}
