//! Source-control collaborator.
//!
//! The control plane only needs a handful of branch operations on a single
//! shared working tree, so the interface is small and synchronous. Async
//! callers go through [`blocking`].

use std::{
    path::{Component, Path, PathBuf},
    process::Command,
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

const MAIN_BRANCH: &str = "main";

pub trait Vcs: Send + Sync + 'static {
    /// Creates `name` at the current HEAD and checks it out.
    fn create_branch(&self, name: &str) -> Result<()>;
    fn delete_branch(&self, name: &str) -> Result<()>;
    fn checkout(&self, name: &str) -> Result<()>;
    /// Empty when the commit cannot be resolved.
    fn current_commit(&self) -> String;
    fn working_tree_root(&self) -> &Path;
    /// Writes a file relative to the working tree root.
    fn write_file(&self, rel_path: &str, content: &str) -> Result<()>;
}

/// Runs a VCS call on the blocking pool.
pub async fn blocking<T, F>(vcs: Arc<dyn Vcs>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Vcs) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(vcs.as_ref()))
        .await
        .map_err(|e| anyhow!("vcs task failed: {e}"))?
}

/// Rejects absolute paths and `..` so writes stay inside the working tree.
pub fn normalize_rel_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel.trim());
    if p.as_os_str().is_empty() {
        return Err(anyhow!("path must be non-empty"));
    }
    if p.is_absolute() {
        return Err(anyhow!("path must be relative"));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(anyhow!("path traversal is not allowed")),
            Component::Prefix(_) | Component::RootDir => {
                return Err(anyhow!("path must be relative"));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(anyhow!("path must name a file"));
    }
    Ok(out)
}

/// `git -C <root> ...` subprocess wrapper.
#[derive(Debug, Clone)]
pub struct GitVcs {
    root: PathBuf,
}

impl GitVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_checked(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            return Err(anyhow!(
                "git {} failed: {} ({})",
                args.first().copied().unwrap_or_default(),
                text.trim(),
                out.status
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

impl Vcs for GitVcs {
    #[instrument(skip(self))]
    fn create_branch(&self, name: &str) -> Result<()> {
        debug!(branch = name, "creating branch");
        self.run_checked(&["checkout", "-b", name]).map(|_| ())
    }

    #[instrument(skip(self))]
    fn delete_branch(&self, name: &str) -> Result<()> {
        // git refuses to delete the checked-out branch.
        if let Err(e) = self.run_checked(&["checkout", MAIN_BRANCH]) {
            warn!(error = %e, "could not switch to {MAIN_BRANCH} before branch delete");
        }
        self.run_checked(&["branch", "-D", name]).map(|_| ())
    }

    fn checkout(&self, name: &str) -> Result<()> {
        self.run_checked(&["checkout", name])
            .with_context(|| format!("checkout branch {name}"))
            .map(|_| ())
    }

    fn current_commit(&self) -> String {
        self.run_checked(&["rev-parse", "HEAD"]).unwrap_or_default()
    }

    fn working_tree_root(&self) -> &Path {
        &self.root
    }

    fn write_file(&self, rel_path: &str, content: &str) -> Result<()> {
        let rel = normalize_rel_path(rel_path)?;
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, content).with_context(|| format!("write {}", path.display()))
    }
}
