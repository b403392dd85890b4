//! On-disk application layout

use std::path::{Path, PathBuf};

use tracing::info;

use crate::errors::HostError;
use crate::filesys::dir::Dir;

/// Version directories under the application root.
///
/// `next/` holds a deploy being staged, `current/` the serving version and `previous/` the
/// one it replaced.
#[derive(Debug, Clone)]
pub struct AppLayout {
    /// Base directory for all versions
    pub root: PathBuf,
}

impl AppLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn next_dir(&self) -> Dir {
        Dir::new(self.root.join("next"))
    }

    pub fn current_dir(&self) -> Dir {
        Dir::new(self.root.join("current"))
    }

    pub fn previous_dir(&self) -> Dir {
        Dir::new(self.root.join("previous"))
    }

    /// Create the root directory
    pub async fn setup(&self) -> Result<(), HostError> {
        Dir::new(&self.root).create().await
    }

    /// Remove a stale `next/` and recreate it empty
    pub async fn prepare_next(&self) -> Result<Dir, HostError> {
        let next = self.next_dir();
        next.delete().await?;
        next.create().await?;
        Ok(next)
    }

    /// Drop `previous/`, move `current/` to `previous/` and promote `next/` to `current/`
    pub async fn rotate(&self) -> Result<(), HostError> {
        self.previous_dir().delete().await?;

        if !self.current_dir().rename_to(&self.previous_dir()).await? {
            info!("No current version to keep as previous");
        }

        if !self.next_dir().rename_to(&self.current_dir()).await? {
            return Err(HostError::SwapFailure(format!(
                "{} is missing",
                self.next_dir().path().display()
            )));
        }

        Ok(())
    }
}

/// Directories inside one application tree
pub fn config_dir(tree: &Dir) -> Dir {
    tree.subdir("config")
}

pub fn sql_dir(tree: &Dir) -> Dir {
    tree.subdir("sql")
}
