//! Host-side worktree and project state exposed to extensions.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("path {path:?} escapes the worktree root")]
    OutsideRoot { path: PathBuf },

    #[error("failed to read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to update permissions for {path:?}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One worktree a sandboxed extension may inspect.
///
/// File access is confined to `root`: guest-supplied paths are resolved
/// against it and rejected if they are absolute or climb out of it.
#[derive(Debug, Clone)]
pub struct Worktree {
    id: u64,
    root: PathBuf,
    search_path: Vec<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Worktree {
    /// Creates a worktree rooted at `root`, inheriting the process
    /// environment and `PATH` for `shell_env` and `which`.
    pub fn new(id: u64, root: impl Into<PathBuf>) -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|path| std::env::split_paths(&path).collect())
            .unwrap_or_default();
        let env = std::env::vars().collect();
        Self {
            id,
            root: root.into(),
            search_path,
            env,
        }
    }

    /// Replaces the binary search path consulted by [`Worktree::which`].
    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Replaces the environment reported by [`Worktree::shell_env`].
    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env = env.into_iter().collect();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn root_path(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, WorktreeError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(WorktreeError::OutsideRoot {
                path: relative.to_path_buf(),
            });
        }
        Ok(self.root.join(relative))
    }

    /// Reads a file under the worktree root as UTF-8 text.
    pub fn read_text_file(&self, path: &str) -> Result<String, WorktreeError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|source| WorktreeError::Io {
            path: resolved,
            source,
        })
    }

    /// Locates `command` on the search path, like `which(1)`.
    pub fn which(&self, command: &str) -> Option<String> {
        for dir in &self.search_path {
            let candidate = dir.join(command);
            if is_executable(&candidate) {
                return Some(candidate.to_string_lossy().into_owned());
            }
        }
        None
    }

    /// The environment a shell in this worktree would see, sorted by
    /// variable name.
    pub fn shell_env(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// The set of worktrees behind a project handle.
#[derive(Debug, Clone, Default)]
pub struct Project {
    worktree_ids: Vec<u64>,
}

impl Project {
    pub fn new(worktree_ids: Vec<u64>) -> Self {
        Self { worktree_ids }
    }

    pub fn worktree_ids(&self) -> &[u64] {
        &self.worktree_ids
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Adds execute permission to an existing file, for binaries an
/// extension has just downloaded or unpacked.
#[cfg(unix)]
pub fn make_file_executable(path: &Path) -> Result<(), WorktreeError> {
    use std::os::unix::fs::PermissionsExt;
    let permissions_error = |source| WorktreeError::Permissions {
        path: path.to_path_buf(),
        source,
    };
    let metadata = path.metadata().map_err(permissions_error)?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    std::fs::set_permissions(path, permissions).map_err(permissions_error)
}

#[cfg(not(unix))]
pub fn make_file_executable(_path: &Path) -> Result<(), WorktreeError> {
    Ok(())
}
