//! In-memory reference adapter.
//!
//! Backs every sandbox with process-local state and never touches the
//! network or the host filesystem. `exec` echoes the command on stdout with
//! exit code 0 unless a response was registered for that `(id, command)`
//! pair beforehand, which is how agent logic gets tested without a real
//! provider.
//!
//! Concurrent `exec` calls against one sandbox are independent. Each holds
//! the state lock only long enough to append to the sandbox history; no
//! ordering between calls is guaranteed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::sandbox::adapter::SandboxAdapter;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::*;

pub const ADAPTER_NAME: &str = "memory";

struct Checkpoint {
    reference: CheckpointRef,
    files: BTreeMap<String, Vec<u8>>,
}

struct MemorySandbox {
    config: SandboxConfig,
    status: SandboxStatus,
    files: BTreeMap<String, Vec<u8>>,
    checkpoints: Vec<Checkpoint>,
    history: Vec<String>,
}

impl MemorySandbox {
    fn ensure_running(&self, id: &str) -> Result<(), SandboxError> {
        match self.status {
            SandboxStatus::Running => Ok(()),
            other => Err(SandboxError::InvalidState {
                id: id.to_string(),
                state: other.to_string(),
            }),
        }
    }
}

type ResponseKey = (SandboxId, String);

pub struct InMemoryAdapter {
    capabilities: AdapterCapabilities,
    sandboxes: RwLock<HashMap<SandboxId, MemorySandbox>>,
    responses: RwLock<HashMap<ResponseKey, ExecResult>>,
    counter: AtomicU64,
    calls: AtomicU64,
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self {
            capabilities: AdapterCapabilities::all(),
            sandboxes: RwLock::new(HashMap::new()),
            responses: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Advertise a narrower capability set, e.g. to exercise the
    /// unsupported-operation path of callers.
    pub fn with_capabilities(mut self, capabilities: AdapterCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make `exec(id, command)` return `result`. Register before the exec.
    pub async fn register_response(&self, id: &str, command: &str, result: ExecResult) {
        self.responses
            .write()
            .await
            .insert((id.to_string(), command.to_string()), result);
    }

    /// Commands executed against `id`, in call order.
    pub async fn history(&self, id: &str) -> Vec<String> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    pub async fn config_of(&self, id: &str) -> Option<SandboxConfig> {
        self.sandboxes.read().await.get(id).map(|s| s.config.clone())
    }

    /// Number of adapter operations invoked so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn with_sandbox<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut MemorySandbox) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let mut sandboxes = self.sandboxes.write().await;
        let sandbox = sandboxes
            .get_mut(id)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))?;
        f(sandbox)
    }
}

#[async_trait]
impl SandboxAdapter for InMemoryAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: ADAPTER_NAME,
            capabilities: self.capabilities.clone(),
        }
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Provisioned, SandboxError> {
        self.record_call();
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("mem-{seq}");

        let labels = config
            .get("labels")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        self.sandboxes.write().await.insert(
            id.clone(),
            MemorySandbox {
                config: config.clone(),
                status: SandboxStatus::Running,
                files: BTreeMap::new(),
                checkpoints: Vec::new(),
                history: Vec::new(),
            },
        );
        tracing::debug!(sandbox_id = %id, "in-memory sandbox provisioned");

        Ok(Provisioned {
            id,
            metadata: SandboxMetadata {
                created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
                labels,
            },
        })
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        _opts: &ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            sandbox.history.push(command.to_string());
            Ok(())
        })
        .await?;

        let key = (id.to_string(), command.to_string());
        if let Some(result) = self.responses.read().await.get(&key) {
            return Ok(result.clone());
        }
        Ok(ExecResult::new(command, "", 0))
    }

    async fn terminate(&self, id: &str, _opts: &TerminateOptions) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.status = SandboxStatus::Terminated;
            sandbox.files.clear();
            sandbox.checkpoints.clear();
            Ok(())
        })
        .await
    }

    async fn status(&self, id: &str, _opts: &StatusOptions) -> Result<SandboxStatus, SandboxError> {
        self.record_call();
        self.sandboxes
            .read()
            .await
            .get(id)
            .map(|s| s.status)
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    async fn get_url(&self, id: &str, port: u16, opts: &UrlOptions) -> Result<String, SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| sandbox.ensure_running(id)).await?;
        let scheme = opts.protocol.as_deref().unwrap_or("http");
        Ok(format!("{scheme}://{id}.sandbox.local:{port}"))
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| SandboxError::NotFound(format!("{id}:{path}")))
        })
        .await
    }

    async fn write_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            sandbox.files.insert(path.to_string(), contents.to_vec());
            Ok(())
        })
        .await
    }

    async fn write_files(&self, id: &str, files: &[FileWrite]) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            for file in files {
                sandbox.files.insert(file.path.clone(), file.contents.clone());
            }
            Ok(())
        })
        .await
    }

    async fn await_ready(&self, id: &str, _opts: &ReadyOptions) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| sandbox.ensure_running(id)).await
    }

    async fn update(&self, id: &str, config: &SandboxConfig) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.config.merge(config);
            Ok(())
        })
        .await
    }

    async fn stop(&self, id: &str) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            sandbox.status = SandboxStatus::Stopped;
            Ok(())
        })
        .await
    }

    async fn start(&self, id: &str) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| match sandbox.status {
            SandboxStatus::Stopped | SandboxStatus::Running => {
                sandbox.status = SandboxStatus::Running;
                Ok(())
            }
            other => Err(SandboxError::InvalidState {
                id: id.to_string(),
                state: other.to_string(),
            }),
        })
        .await
    }

    async fn create_checkpoint(
        &self,
        id: &str,
        opts: &CheckpointOptions,
    ) -> Result<CheckpointId, SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            let reference = CheckpointRef {
                id: format!("cp-{}", uuid::Uuid::new_v4().simple()),
                name: opts.name.clone(),
                created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            };
            let checkpoint_id = reference.id.clone();
            sandbox.checkpoints.push(Checkpoint {
                reference,
                files: sandbox.files.clone(),
            });
            Ok(checkpoint_id)
        })
        .await
    }

    async fn restore_checkpoint(&self, id: &str, checkpoint_id: &str) -> Result<(), SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            sandbox.ensure_running(id)?;
            let snapshot = sandbox
                .checkpoints
                .iter()
                .find(|c| c.reference.id == checkpoint_id)
                .map(|c| c.files.clone())
                .ok_or_else(|| SandboxError::NotFound(format!("checkpoint {checkpoint_id}")))?;
            sandbox.files = snapshot;
            Ok(())
        })
        .await
    }

    async fn list_checkpoints(
        &self,
        id: &str,
        _opts: &CheckpointOptions,
    ) -> Result<Vec<CheckpointRef>, SandboxError> {
        self.record_call();
        self.with_sandbox(id, |sandbox| {
            Ok(sandbox.checkpoints.iter().map(|c| c.reference.clone()).collect())
        })
        .await
    }
}
