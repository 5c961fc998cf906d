//! Workspace resolution — maps `/workspace` arguments to directories under the
//! configured base and re-validates saved workspaces.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("no workspace base directory is configured")]
    NoBase,
    #[error("absolute paths are not allowed, use a workspace name")]
    AbsolutePath,
    #[error("invalid workspace name: {0}")]
    InvalidName(String),
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("failed to create workspace: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct WorkspaceResolver {
    home: PathBuf,
    base: Option<PathBuf>,
}

impl WorkspaceResolver {
    pub fn new(home: impl Into<PathBuf>, base: Option<PathBuf>) -> Self {
        let base = base.map(|b| b.canonicalize().unwrap_or(b));
        Self {
            home: home.into(),
            base,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Resolve a user-supplied name to an existing workspace directory.
    ///
    /// `home` always maps to the home workspace. Everything else must be a
    /// relative name that stays inside the base directory.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, WorkspaceError> {
        let target = target.trim();
        if target.eq_ignore_ascii_case("home") {
            return Ok(self.home.clone());
        }
        let path = self.under_base(target)?;
        if !path.exists() {
            return Err(WorkspaceError::NotFound(path));
        }
        if !path.is_dir() {
            return Err(WorkspaceError::NotADirectory(path));
        }
        // Symlinks may still point outside the base.
        let real = path.canonicalize()?;
        if !self.is_under_base(&real) {
            return Err(WorkspaceError::InvalidName(target.to_string()));
        }
        Ok(real)
    }

    /// Create a new workspace under the base and initialise a git repository
    /// in it. Git failures are logged, not fatal.
    pub async fn create(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("home") {
            return Err(WorkspaceError::InvalidName(name.to_string()));
        }
        let path = self.under_base(name)?;
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(path));
        }
        tokio::fs::create_dir_all(&path).await?;
        info!("Created workspace {}", path.display());

        let git = tokio::process::Command::new("git")
            .arg("init")
            .current_dir(&path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match git {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("git init in {} exited with {}", path.display(), status),
            Err(e) => warn!("git init in {} failed: {}", path.display(), e),
        }
        Ok(path)
    }

    /// Whether a saved workspace is still usable.
    pub fn validate(&self, path: &Path) -> bool {
        if path == self.home {
            return path.is_dir();
        }
        match path.canonicalize() {
            Ok(real) => real.is_dir() && self.is_under_base(&real),
            Err(_) => false,
        }
    }

    /// Short label for display: `Home`, or the path relative to the base.
    pub fn label(&self, path: &Path) -> String {
        if path == self.home {
            return "Home".to_string();
        }
        self.base
            .as_deref()
            .and_then(|base| path.strip_prefix(base).ok())
            .map(|rel| rel.display().to_string())
            .unwrap_or_else(|| path.display().to_string())
    }

    fn under_base(&self, target: &str) -> Result<PathBuf, WorkspaceError> {
        if target.starts_with('/') || target.starts_with('~') || Path::new(target).is_absolute() {
            return Err(WorkspaceError::AbsolutePath);
        }
        let base = self.base.as_ref().ok_or(WorkspaceError::NoBase)?;
        let relative = Path::new(target);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if target.is_empty() || !plain {
            return Err(WorkspaceError::InvalidName(target.to_string()));
        }
        Ok(base.join(relative))
    }

    fn is_under_base(&self, path: &Path) -> bool {
        match &self.base {
            Some(base) => path.starts_with(base) && path != base,
            None => false,
        }
    }
}
