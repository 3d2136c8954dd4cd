use std::path::{Component, Path, PathBuf};

use crate::sandbox::error::SandboxError;

/// Workspace directory with path containment.
///
/// Guest paths are interpreted relative to the workspace root and may not
/// climb above it. Not a chroot: symlinks created by sandboxed commands are
/// not policed.
pub struct FsJail {
    root: PathBuf,
}

impl FsJail {
    /// Create the workspace directory if needed.
    pub fn create(root: PathBuf) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create workspace dir {}: {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn attach(root: PathBuf) -> Result<Self, SandboxError> {
        if !root.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "workspace dir does not exist: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Map a guest path onto the host, rejecting `..` escapes.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        let mut normalized = PathBuf::new();
        for component in Path::new(guest_path).components() {
            match component {
                Component::Normal(seg) => normalized.push(seg),
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::Exec(format!(
                            "path escapes workspace: {guest_path}"
                        )));
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }

        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        Ok(root.join(normalized))
    }

    pub fn read(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.resolve(guest_path)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxError::NotFound(guest_path.to_string()),
            _ => SandboxError::Io(e),
        })
    }

    /// Write a file, creating parent directories inside the workspace.
    pub fn write(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        let path = self.resolve(guest_path)?;
        if path == self.resolve("/")? {
            return Err(SandboxError::Exec("cannot write to workspace root".into()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    pub fn destroy(&self) -> Result<(), SandboxError> {
        if self.root.exists() {
            std::fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
