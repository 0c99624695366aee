use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Result, anyhow};
use shipyard_version::{AgentVersion, VersionId, VersionStatus};

use crate::{
    config::ControlConfig,
    registry::Registry,
    vcs::{Vcs, normalize_rel_path},
};

pub const FAKE_COMMIT: &str = "deadbeefcafe";

/// In-memory VCS that records every call and can be told to fail.
#[derive(Debug)]
pub struct FakeVcs {
    root: PathBuf,
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeVcs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Makes every later call of `op` (`"create_branch"`, `"checkout"`, ...) fail.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, arg: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{op} {arg}"));
        if self.failing.lock().unwrap().contains(op) {
            return Err(anyhow!("{op} {arg}: injected failure"));
        }
        Ok(())
    }
}

impl Vcs for FakeVcs {
    fn create_branch(&self, name: &str) -> Result<()> {
        self.record("create_branch", name)
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        self.record("delete_branch", name)
    }

    fn checkout(&self, name: &str) -> Result<()> {
        self.record("checkout", name)
    }

    fn current_commit(&self) -> String {
        FAKE_COMMIT.to_string()
    }

    fn working_tree_root(&self) -> &Path {
        &self.root
    }

    fn write_file(&self, rel_path: &str, content: &str) -> Result<()> {
        self.record("write_file", rel_path)?;
        let path = self.root.join(normalize_rel_path(rel_path)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Config with short timeouts and a build that copies a sleeping script.
pub fn test_config(data_dir: &Path) -> ControlConfig {
    let mut cfg = ControlConfig::with_data_dir(data_dir);
    cfg.build_command = "printf '#!/bin/sh\\nexec sleep 30\\n' > \"$SHIPYARD_BUILD_OUTPUT\" && chmod +x \"$SHIPYARD_BUILD_OUTPUT\""
        .to_string();
    cfg.build_timeout = Duration::from_secs(20);
    cfg.restart_grace = Duration::from_millis(50);
    cfg.stop_timeout = Duration::from_secs(2);
    cfg
}

pub async fn registry_in(data_dir: &Path) -> Registry {
    Registry::load(&test_config(data_dir)).await.unwrap()
}

/// A built, never-started record whose binary lives under `data_dir`.
pub fn ready_version(id: &str, data_dir: &Path) -> AgentVersion {
    let id = VersionId(id.to_string());
    let binary = data_dir.join(id.as_str()).join("agent");
    let mut v = AgentVersion::new(id, "test version", "desc", binary);
    v.status = VersionStatus::Ready;
    v
}

/// Writes an executable `/bin/sh` script at `path`.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Polls `check` until it yields `true` or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether any process with `pid` still exists (zombies excluded).
#[cfg(unix)]
pub fn pid_exists(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } != 0 {
        return false;
    }
    // A zombie still answers signal 0; look at its state on Linux.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}
