use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ExecOptions, ExecResult};

/// Runs shell commands for the host adapter: filtered env, capped output,
/// timeout that kills the command's whole process group.
pub struct ProcessSupervisor {
    pub shell: Vec<String>,
    /// Host variables passed through to commands.
    pub env_allowlist: Vec<String>,
    /// Per-stream cap; anything beyond is dropped.
    pub max_output_bytes: usize,
    pub default_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            shell: vec!["/bin/sh".into(), "-c".into()],
            env_allowlist,
            max_output_bytes,
            default_timeout: Duration::from_secs(15 * 60),
        }
    }

    fn build_env(
        &self,
        sandbox_env: &BTreeMap<String, String>,
        call_env: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self
            .env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|val| (key.clone(), val)))
            .collect();
        env.extend(sandbox_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(call_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Run `command` through the shell inside `working_dir`.
    ///
    /// Exceeding the timeout kills the child and reports
    /// `SandboxError::Timeout`.
    pub async fn exec(
        &self,
        command: &str,
        opts: &ExecOptions,
        sandbox_env: &BTreeMap<String, String>,
        working_dir: &Path,
    ) -> Result<ExecResult, SandboxError> {
        if command.trim().is_empty() {
            return Err(SandboxError::Exec("empty command".into()));
        }
        let (program, shell_args) = self
            .shell
            .split_first()
            .ok_or_else(|| SandboxError::Exec("no shell configured".into()))?;

        let script = if opts.merge_stderr {
            format!("exec 2>&1\n{command}")
        } else {
            command.to_string()
        };

        let mut cmd = Command::new(program);
        cmd.args(shell_args).arg(&script);
        cmd.current_dir(working_dir);
        cmd.env_clear();
        cmd.envs(self.build_env(sandbox_env, &opts.env));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        // Own group, so a timeout also reaches anything the shell backgrounded.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;
        let pid = child.id();

        let max_bytes = self.max_output_bytes;
        let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_capped(pipe, max_bytes)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_capped(pipe, max_bytes)));

        // The deadline covers draining too: a background job can hold the
        // pipes open after the shell itself exits.
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await?;
            let stdout = match stdout {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let stderr = match stderr {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => return Err(SandboxError::Exec(format!("wait failed: {e}"))),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid).await;
                }
                let _ = child.kill().await;
                tracing::warn!(command = %command, ?timeout, "command timed out, killed");
                return Err(SandboxError::Timeout(timeout));
            }
        };

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code(&status),
        })
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut pipe: R, max_bytes: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

async fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .args(["-KILL", &format!("-{pid}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
    #[cfg(not(unix))]
    {
        tracing::warn!(pid, "process group kill not implemented on this platform");
    }
}

/// Killed-by-signal maps to 128 + signal, as shells report it.
fn exit_code(status: &std::process::ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(vec!["PATH".into()], 1024 * 1024)
    }

    async fn run(command: &str, opts: ExecOptions) -> Result<ExecResult, SandboxError> {
        let tmp = tempfile::tempdir().unwrap();
        supervisor().exec(command, &opts, &BTreeMap::new(), tmp.path()).await
    }

    #[tokio::test]
    async fn exec_echo() {
        let result = run("echo hello sandbox", ExecOptions::default()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello sandbox");
        assert!(result.stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_nonzero_exit() {
        let result = run("exit 42", ExecOptions::default()).await.unwrap();
        assert_eq!(result.exit_code, 42);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn exec_merges_stderr_when_asked() {
        let split = run("echo oops >&2", ExecOptions::default()).await.unwrap();
        assert!(split.stdout.is_empty());
        assert_eq!(split.output().trim(), "oops");

        let merged = run("echo oops >&2", ExecOptions::default().merge_stderr()).await.unwrap();
        assert_eq!(merged.stdout.trim(), "oops");
        assert!(merged.stderr.is_empty());
    }

    #[tokio::test]
    async fn exec_env_layers() {
        let tmp = tempfile::tempdir().unwrap();
        let sandbox_env = BTreeMap::from([
            ("A".to_string(), "sandbox".to_string()),
            ("B".to_string(), "sandbox".to_string()),
        ]);
        let opts = ExecOptions::default().env("B", "call");
        let result = supervisor()
            .exec("echo $A-$B", &opts, &sandbox_env, tmp.path())
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "sandbox-call");
    }

    #[tokio::test]
    async fn exec_host_env_is_filtered() {
        // HOME is not in the allowlist used by these tests.
        let result = run("echo \"[$HOME]\"", ExecOptions::default()).await.unwrap();
        assert_eq!(result.stdout.trim(), "[]");
    }

    #[tokio::test]
    async fn exec_timeout_kills() {
        let err = run("sleep 60", ExecOptions::default().timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn exec_timeout_covers_background_holders() {
        let started = std::time::Instant::now();
        let err = run("sleep 5 & echo hi", ExecOptions::default().timeout(Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn exec_output_is_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(vec!["PATH".into()], 10);
        let result = sup
            .exec("printf 'aaaaaaaaaaaaaaaaaaaa'", &ExecOptions::default(), &BTreeMap::new(), tmp.path())
            .await
            .unwrap();
        assert_eq!(result.stdout.len(), 10);
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        assert!(matches!(
            run("   ", ExecOptions::default()).await,
            Err(SandboxError::Exec(_))
        ));
    }
}
