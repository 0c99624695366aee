use std::{
    path::Path,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use shipyard_version::{AgentVersion, Transition, VersionId};
use tokio::{
    io::AsyncReadExt,
    sync::{Mutex, MutexGuard},
};
use tracing::{info, instrument, warn};

use crate::{
    config::ControlConfig,
    error::{MAX_ERROR_BYTES, VersionError, format_error_chain, truncate_utf8_tail},
    registry::{Registry, step},
    vcs::{self, Vcs},
};

/// Turns a version's branch into an executable at its `binary_path`.
///
/// There is a single shared working tree, so every operation that checks
/// out a branch goes through one queue lock. The registry lock is never held
/// while waiting on it.
pub struct BuildPipeline {
    registry: Arc<Registry>,
    vcs: Option<Arc<dyn Vcs>>,
    queue: Mutex<()>,
    command: String,
    timeout: Duration,
}

impl BuildPipeline {
    pub fn new(registry: Arc<Registry>, vcs: Option<Arc<dyn Vcs>>, config: &ControlConfig) -> Self {
        Self {
            registry,
            vcs,
            queue: Mutex::new(()),
            command: config.build_command.clone(),
            timeout: config.build_timeout,
        }
    }

    pub fn vcs(&self) -> Option<&Arc<dyn Vcs>> {
        self.vcs.as_ref()
    }

    /// Exclusive use of the working tree for branch creation and edits.
    pub async fn lock_working_tree(&self) -> MutexGuard<'_, ()> {
        self.queue.lock().await
    }

    pub async fn build(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.build_from(id, Transition::BeginBuild).await
    }

    /// Like `build`, but also accepts a version that was stopped.
    pub async fn rebuild(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.build_from(id, Transition::Rebuild).await
    }

    #[instrument(skip_all, fields(id = %id, via = %begin))]
    async fn build_from(&self, id: &VersionId, begin: Transition) -> Result<AgentVersion, VersionError> {
        let v = self
            .registry
            .update(id, |v| {
                step(v, begin)?;
                v.error = None;
                Ok(())
            })
            .await?;
        info!(branch = %v.branch, "build started");

        match self.run(&v).await {
            Ok(commit) => {
                let v = self
                    .registry
                    .update(id, |v| {
                        step(v, Transition::BuildSucceeded)?;
                        v.built_at = Some(Utc::now());
                        if !commit.is_empty() {
                            v.commit_hash = commit;
                        }
                        v.error = None;
                        Ok(())
                    })
                    .await?;
                info!(commit = %v.commit_hash, "build succeeded");
                Ok(v)
            }
            Err(err) => {
                let msg = err.to_string();
                warn!(error = %msg, "build failed");
                if let Err(persist) = self
                    .registry
                    .update(id, |v| {
                        step(v, Transition::BuildFailed)?;
                        v.error = Some(msg);
                        Ok(())
                    })
                    .await
                {
                    warn!(error = %persist, "failed to record build failure");
                }
                Err(err)
            }
        }
    }

    /// Checkout, external build, artifact check. Returns the built commit.
    async fn run(&self, v: &AgentVersion) -> Result<String, VersionError> {
        let Some(vcs) = self.vcs.clone() else {
            return Err(VersionError::BuildFailed(
                "repository not initialized".to_string(),
            ));
        };

        let _queue = self.queue.lock().await;

        let branch = v.branch.clone();
        vcs::blocking(vcs.clone(), move |vcs| vcs.checkout(&branch))
            .await
            .map_err(|e| VersionError::BuildFailed(format_error_chain(&e)))?;

        let src = vcs.working_tree_root().to_path_buf();
        prepare_output(&v.binary_path).await?;
        run_build_command(&self.command, &src, &v.binary_path, self.timeout).await?;
        verify_artifact(&v.binary_path).await?;

        let commit = vcs::blocking(vcs, |vcs| Ok(vcs.current_commit()))
            .await
            .unwrap_or_default();
        Ok(commit)
    }
}

/// Ensures the output directory exists and no stale artifact can pass
/// verification.
async fn prepare_output(binary: &Path) -> Result<(), VersionError> {
    if let Some(parent) = binary.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(binary).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Kills every process left in the build's group. Only the group is
/// signalled: the leader may already be reaped and its pid reused.
#[cfg(unix)]
fn kill_build_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if pgid <= 0 {
        return;
    }
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_build_group(_pgid: u32) {}

fn read_pipe<R>(pipe: Option<R>) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

/// Runs the build in its own process group. Whatever it forked is killed
/// before this returns, so nothing keeps writing into the working tree once
/// the queue lock is released.
async fn run_build_command(
    command: &str,
    src: &Path,
    output: &Path,
    timeout: Duration,
) -> Result<(), VersionError> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(src)
        .env("SHIPYARD_BUILD_OUTPUT", output)
        .env("SHIPYARD_BUILD_SRC", src)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| VersionError::BuildFailed(format!("spawn build command: {e}")))?;
    let pgid = child.id().unwrap_or(0);
    let stdout = read_pipe(child.stdout.take());
    let stderr = read_pipe(child.stderr.take());

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    // The leader is gone or timed out; either way the rest of the group goes too.
    kill_build_group(pgid);
    let status = match waited {
        Err(_) => {
            let _ = child.kill().await;
            return Err(VersionError::BuildFailed(format!(
                "build timed out after {timeout:?}"
            )));
        }
        Ok(Err(e)) => {
            return Err(VersionError::BuildFailed(format!(
                "wait for build command: {e}"
            )));
        }
        Ok(Ok(status)) => status,
    };

    if !status.success() {
        let mut text = String::from_utf8_lossy(&stdout.await.unwrap_or_default()).into_owned();
        text.push_str(&String::from_utf8_lossy(&stderr.await.unwrap_or_default()));
        let text = truncate_utf8_tail(text.trim(), MAX_ERROR_BYTES);
        return Err(VersionError::BuildFailed(format!(
            "build command {status}: {text}"
        )));
    }
    Ok(())
}

async fn verify_artifact(binary: &Path) -> Result<(), VersionError> {
    let meta = tokio::fs::metadata(binary).await.map_err(|_| {
        VersionError::BuildFailed(format!("no artifact at {}", binary.display()))
    })?;
    if !meta.is_file() {
        return Err(VersionError::BuildFailed(format!(
            "artifact at {} is not a file",
            binary.display()
        )));
    }
    if meta.len() == 0 {
        return Err(VersionError::BuildFailed(format!(
            "empty artifact at {}",
            binary.display()
        )));
    }
    Ok(())
}
