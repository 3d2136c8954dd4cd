use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;
pub type CheckpointId = String;

// ── Configuration ───────────────────────────────────────────────────

/// Normalized sandbox configuration.
///
/// Callers may hand over an already-keyed mapping or an ordered list of
/// key/value pairs; both end up as the same string-keyed map before an
/// adapter sees them. Later pairs win on duplicate keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxConfig(BTreeMap<String, Value>);

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Overlay `other` on top of this config, key by key.
    pub fn merge(&mut self, other: &SandboxConfig) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Typed view over the standard fields adapters understand.
    pub fn settings(&self) -> Result<SandboxSettings, serde_json::Error> {
        let map: serde_json::Map<String, Value> = self.0.clone().into_iter().collect();
        serde_json::from_value(Value::Object(map))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for SandboxConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<Value>> From<Vec<(K, V)>> for SandboxConfig {
    fn from(pairs: Vec<(K, V)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for SandboxConfig {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<BTreeMap<String, Value>> for SandboxConfig {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl From<HashMap<String, Value>> for SandboxConfig {
    fn from(map: HashMap<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

impl From<serde_json::Map<String, Value>> for SandboxConfig {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

/// Standard configuration fields. Unknown keys are ignored here and left
/// for provider-specific interpretation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Container / runtime image identifier.
    pub image: Option<String>,
    /// Memory limit, either a byte count or a provider string like "512m".
    pub memory: Option<MemoryLimit>,
    #[serde(deserialize_with = "deserialize_env")]
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
    pub mounts: Vec<MountSpec>,
    pub network_proxy: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MemoryLimit {
    Bytes(u64),
    Spec(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// `env` may be `["K=V", ...]` or `{"K": "V"}`.
fn deserialize_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EnvShape {
        List(Vec<String>),
        Map(BTreeMap<String, String>),
    }

    Ok(match EnvShape::deserialize(deserializer)? {
        EnvShape::Map(map) => map,
        EnvShape::List(items) => items
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (item, String::new()),
            })
            .collect(),
    })
}

// ── Capabilities ────────────────────────────────────────────────────

/// Optional operations an adapter may implement. Required operations
/// (`create`, `exec`, `terminate`, `status`) are not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    GetUrl,
    ReadFile,
    WriteFile,
    WriteFiles,
    AwaitReady,
    Update,
    Stop,
    Start,
    CreateCheckpoint,
    RestoreCheckpoint,
    ListCheckpoints,
}

impl Capability {
    pub const ALL: [Capability; 11] = [
        Capability::GetUrl,
        Capability::ReadFile,
        Capability::WriteFile,
        Capability::WriteFiles,
        Capability::AwaitReady,
        Capability::Update,
        Capability::Stop,
        Capability::Start,
        Capability::CreateCheckpoint,
        Capability::RestoreCheckpoint,
        Capability::ListCheckpoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::GetUrl => "get_url",
            Capability::ReadFile => "read_file",
            Capability::WriteFile => "write_file",
            Capability::WriteFiles => "write_files",
            Capability::AwaitReady => "await_ready",
            Capability::Update => "update",
            Capability::Stop => "stop",
            Capability::Start => "start",
            Capability::CreateCheckpoint => "create_checkpoint",
            Capability::RestoreCheckpoint => "restore_checkpoint",
            Capability::ListCheckpoints => "list_checkpoints",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterCapabilities(BTreeSet<Capability>);

impl AdapterCapabilities {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.0.remove(&capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for AdapterCapabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Static description of an adapter: its registry name and which
/// optional operations it implements.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: &'static str,
    pub capabilities: AdapterCapabilities,
}

// ── Metadata / status ───────────────────────────────────────────────

/// What an adapter hands back from `create`.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub id: SandboxId,
    pub metadata: SandboxMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SandboxMetadata {
    pub created_at_unix_ms: i64,
    pub labels: BTreeMap<String, String>,
}

/// Provider-observed lifecycle state. Never cached locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Terminated,
    /// The provider could not answer. Not the same as `Terminated`.
    Unknown,
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Terminated => "terminated",
            SandboxStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ── Exec model ──────────────────────────────────────────────────────

/// Per-call exec options. Honoring each field is adapter-dependent.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub merge_stderr: bool,
}

impl ExecOptions {
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn merge_stderr(mut self) -> Self {
        self.merge_stderr = true;
        self
    }
}

/// Outcome of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl ExecResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: u32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout when it has content, stderr otherwise.
    pub fn output(&self) -> &str {
        if self.stdout.is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

// ── Other per-operation options ─────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TerminateOptions {
    /// Skip graceful shutdown where the provider distinguishes the two.
    pub force: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusOptions {
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ReadyOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ReadyOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    pub protocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileWrite {
    pub path: String,
    pub contents: Vec<u8>,
}

impl FileWrite {
    pub fn new(path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

// ── Checkpoints ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CheckpointOptions {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRef {
    pub id: CheckpointId,
    pub name: Option<String>,
    pub created_at_unix_ms: i64,
}

// ── Tests ───────────────────────────────────────────────────────────
