//! Host-process adapter.
//!
//! Each sandbox is a workspace directory under `root_dir`; commands run as
//! the current user through `/bin/sh -c` with a filtered environment.
//! Best-effort isolation only, for trusted workloads.
//!
//! Concurrent `exec` calls against one sandbox run as independent child
//! processes sharing the workspace; they are not serialized.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;

use crate::sandbox::adapter::SandboxAdapter;
use crate::sandbox::error::SandboxError;
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::types::*;

pub const ADAPTER_NAME: &str = "local";

/// Per-sandbox env is persisted beside the workspace, out of the guest's
/// reach, so `from_id` handles pick it up.
const ENV_SUFFIX: &str = ".env.json";

#[derive(Debug, Clone)]
pub struct LocalHostConfig {
    pub root_dir: PathBuf,
    pub inherit_env_allowlist: Vec<String>,
    pub max_output_bytes: usize,
}

impl LocalHostConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            inherit_env_allowlist: vec!["PATH".into(), "LANG".into(), "TERM".into()],
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

pub struct LocalHostAdapter {
    config: LocalHostConfig,
    supervisor: ProcessSupervisor,
}

impl LocalHostAdapter {
    pub fn new(config: LocalHostConfig) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create sandboxes root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        let supervisor = ProcessSupervisor::new(
            config.inherit_env_allowlist.clone(),
            config.max_output_bytes,
        );
        Ok(Self { config, supervisor })
    }

    fn jail(&self, id: &str) -> Result<FsJail, SandboxError> {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id.starts_with('.') {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        FsJail::attach(self.config.root_dir.join(id))
            .map_err(|_| SandboxError::NotFound(id.to_string()))
    }

    fn env_path(&self, id: &str) -> PathBuf {
        self.config.root_dir.join(format!("{id}{ENV_SUFFIX}"))
    }

    fn sandbox_env(&self, id: &str) -> BTreeMap<String, String> {
        std::fs::read(self.env_path(id))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxAdapter for LocalHostAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: ADAPTER_NAME,
            capabilities: AdapterCapabilities::none()
                .with(Capability::ReadFile)
                .with(Capability::WriteFile)
                .with(Capability::WriteFiles)
                .with(Capability::AwaitReady),
        }
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Provisioned, SandboxError> {
        let settings = config
            .settings()
            .map_err(|e| SandboxError::Config(e.to_string()))?;
        if settings.image.is_some() {
            tracing::warn!(image = ?settings.image, "local adapter ignores image");
        }

        let id = format!("local-{}", uuid::Uuid::new_v4().simple());
        let jail = FsJail::create(self.config.root_dir.join(&id))?;
        if !settings.env.is_empty() {
            let env = serde_json::to_vec(&settings.env)
                .map_err(|e| SandboxError::Config(e.to_string()))?;
            std::fs::write(self.env_path(&id), &env).map_err(|e| {
                SandboxError::Provision(format!("failed to persist sandbox env: {e}"))
            })?;
        }

        tracing::info!(
            sandbox_id = %id,
            workspace_dir = %jail.root().display(),
            "local sandbox provisioned"
        );

        Ok(Provisioned {
            id,
            metadata: SandboxMetadata {
                created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
                labels: BTreeMap::new(),
            },
        })
    }

    async fn exec(
        &self,
        id: &str,
        command: &str,
        opts: &ExecOptions,
    ) -> Result<ExecResult, SandboxError> {
        let jail = self.jail(id)?;
        let working_dir = match &opts.cwd {
            Some(cwd) => jail.resolve(cwd)?,
            None => jail.root().to_path_buf(),
        };
        let started = Instant::now();
        tracing::debug!(sandbox_id = %id, command = %command, "executing in local sandbox");

        let result = self
            .supervisor
            .exec(command, opts, &self.sandbox_env(id), &working_dir)
            .await?;

        tracing::debug!(
            sandbox_id = %id,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "local exec finished"
        );
        Ok(result)
    }

    async fn terminate(&self, id: &str, _opts: &TerminateOptions) -> Result<(), SandboxError> {
        let jail = self.jail(id)?;
        tracing::info!(sandbox_id = %id, "destroying local sandbox");
        match std::fs::remove_file(self.env_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(sandbox_id = %id, error = %e, "failed to remove sandbox env"),
        }
        jail.destroy()
    }

    async fn status(&self, id: &str, _opts: &StatusOptions) -> Result<SandboxStatus, SandboxError> {
        match self.jail(id) {
            Ok(_) => Ok(SandboxStatus::Running),
            Err(SandboxError::NotFound(_)) => Ok(SandboxStatus::Terminated),
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, id: &str, path: &str) -> Result<Vec<u8>, SandboxError> {
        self.jail(id)?.read(path)
    }

    async fn write_file(&self, id: &str, path: &str, contents: &[u8]) -> Result<(), SandboxError> {
        self.jail(id)?.write(path, contents)
    }

    async fn write_files(&self, id: &str, files: &[FileWrite]) -> Result<(), SandboxError> {
        let jail = self.jail(id)?;
        for file in files {
            jail.write(&file.path, &file.contents)?;
        }
        Ok(())
    }

    async fn await_ready(&self, id: &str, _opts: &ReadyOptions) -> Result<(), SandboxError> {
        self.jail(id).map(|_| ())
    }
}
