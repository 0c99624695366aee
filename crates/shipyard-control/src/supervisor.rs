use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use shipyard_version::{AgentVersion, Transition, VersionId, VersionStatus};
use tokio::{process::Child, sync::watch};
use tracing::{info, warn};

use crate::{
    config::ControlConfig,
    error::VersionError,
    logs,
    registry::{Registry, StartLease, step},
};

/// What the supervisor knows about a process it launched.
#[derive(Debug, Clone)]
struct ProcessHandle {
    pid: u32,
    exited: watch::Receiver<bool>,
}

/// Launches version binaries and watches them until they exit.
///
/// Each running version has one monitor task. The monitor only writes when
/// the record is still `Running` with the pid it launched, so an explicit
/// stop or a newer start always wins.
pub struct Supervisor {
    registry: Arc<Registry>,
    handles: Arc<Mutex<HashMap<VersionId, ProcessHandle>>>,
    stop_timeout: Duration,
    restart_grace: Duration,
}

fn listen_arg(port: u16) -> String {
    format!(":{port}")
}

fn log_path_for(binary: &Path) -> PathBuf {
    binary
        .parent()
        .map(|dir| dir.join("output.log"))
        .unwrap_or_else(|| PathBuf::from("output.log"))
}

#[cfg(unix)]
fn signal_group(pid: u32, sig: i32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    // Children run in their own session, so the group id is the pid.
    let rc = unsafe { libc::kill(-pid, sig) };
    if rc != 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _sig: i32) {}

/// Signal 0: existence check that does not touch the process.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Returns whether the exit was clean and a human-readable reason.
fn describe_exit(status: &std::io::Result<ExitStatus>) -> (bool, String) {
    match status {
        Ok(st) if st.success() => (true, "exited cleanly".to_string()),
        Ok(st) => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(sig) = st.signal() {
                    return (false, format!("terminated by signal {sig}"));
                }
            }
            match st.code() {
                Some(code) => (false, format!("exited with code {code}")),
                None => (false, format!("exited abnormally ({st})")),
            }
        }
        Err(e) => (false, format!("wait failed: {e}")),
    }
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, config: &ControlConfig) -> Self {
        Self {
            registry,
            handles: Arc::new(Mutex::new(HashMap::new())),
            stop_timeout: config.stop_timeout,
            restart_grace: config.restart_grace,
        }
    }

    fn handle(&self, id: &VersionId) -> Option<ProcessHandle> {
        self.handles
            .lock()
            .ok()
            .and_then(|map| map.get(id).cloned())
    }

    fn forget(handles: &Mutex<HashMap<VersionId, ProcessHandle>>, id: &VersionId, pid: u32) {
        if let Ok(mut map) = handles.lock()
            && map.get(id).is_some_and(|h| h.pid == pid)
        {
            map.remove(id);
        }
    }

    pub async fn start(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let lease = self.registry.begin_start(id).await?;

        let mut child = match spawn(&lease).await {
            Ok(child) => child,
            Err(err) => {
                warn!(%id, error = %err, "spawn failed");
                self.registry.abort_start(&lease, Some(err.to_string())).await;
                return Err(err);
            }
        };
        let Some(pid) = child.id() else {
            // Already reaped; nothing to supervise.
            let _ = child.wait().await;
            let err = VersionError::ProcessSpawnFailed("process exited during spawn".to_string());
            self.registry.abort_start(&lease, Some(err.to_string())).await;
            return Err(err);
        };

        let (exited_tx, exited_rx) = watch::channel(false);
        if let Ok(mut map) = self.handles.lock() {
            map.insert(
                id.clone(),
                ProcessHandle {
                    pid,
                    exited: exited_rx,
                },
            );
        }

        match self.registry.commit_start(&lease, pid).await {
            Ok(v) => {
                info!(%id, pid, port = lease.port, "version started");
                self.monitor(child, id.clone(), pid, log_path_for(&lease.binary_path), exited_tx);
                Ok(v)
            }
            Err(err) => {
                // No untracked process may outlive a failed start.
                warn!(%id, pid, error = %err, "failed to record start; killing process");
                signal_group(pid, SIGKILL);
                let _ = child.kill().await;
                Self::forget(&self.handles, id, pid);
                Err(err)
            }
        }
    }

    fn monitor(
        &self,
        mut child: Child,
        id: VersionId,
        pid: u32,
        log_path: PathBuf,
        exited_tx: watch::Sender<bool>,
    ) {
        let registry = self.registry.clone();
        let handles = self.handles.clone();

        tokio::spawn(async move {
            let status = child.wait().await;
            let (clean, reason) = describe_exit(&status);
            // Marker first: once waiters are released the directory may be deleted.
            if let Err(e) = logs::append_marker(&log_path, &format!("process {pid} {reason}")).await {
                warn!(%id, error = %e, "failed to write exit marker");
            }
            exited_tx.send_replace(true);
            Self::forget(&handles, &id, pid);

            let updated = registry
                .update_best_effort(&id, |v| {
                    if v.status != VersionStatus::Running || v.pid != pid {
                        return false;
                    }
                    let t = if clean {
                        Transition::ExitedCleanly
                    } else {
                        Transition::ExitedAbnormally
                    };
                    if step(v, t).is_err() {
                        return false;
                    }
                    v.error = (!clean).then(|| format!("process {reason}"));
                    v.clear_process();
                    true
                })
                .await;

            match updated {
                Some(v) if v.status == VersionStatus::Failed => {
                    warn!(%id, pid, %reason, "version exited unexpectedly");
                }
                Some(_) => info!(%id, pid, "version exited"),
                None => tracing::debug!(%id, pid, %reason, "exit already accounted for"),
            }
        });
    }

    /// Signals the process, records `Stopped`, then waits up to the stop
    /// timeout for it to go away, escalating to `SIGKILL`.
    pub async fn stop(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let mut pid = 0;
        let v = self
            .registry
            .update(id, |v| {
                if !v.is_active() {
                    return Err(VersionError::NotRunning(v.id.clone()));
                }
                pid = v.pid;
                step(v, Transition::Stop)?;
                v.clear_process();
                Ok(())
            })
            .await?;

        let log_path = log_path_for(&v.binary_path);
        if let Err(e) = logs::append_marker(&log_path, &format!("stop requested for process {pid}")).await {
            warn!(%id, error = %e, "failed to write stop marker");
        }

        signal_group(pid, SIGTERM);
        info!(%id, pid, "version stopped");

        if let Some(handle) = self.handle(id).filter(|h| h.pid == pid) {
            let mut exited = handle.exited;
            let exited_in_time = tokio::time::timeout(self.stop_timeout, exited.wait_for(|e| *e))
                .await
                .is_ok();
            if !exited_in_time {
                warn!(%id, pid, "process ignored SIGTERM; sending SIGKILL");
                signal_group(pid, SIGKILL);
                let _ = tokio::time::timeout(Duration::from_secs(2), exited.wait_for(|e| *e)).await;
            }
        }
        Ok(v)
    }

    pub async fn restart(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let current = self.registry.require(id).await?;
        if current.is_active() {
            match self.stop(id).await {
                Ok(_) | Err(VersionError::NotRunning(_)) => {}
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.restart_grace).await;
        }
        self.start(id).await
    }

    /// `false` without error for versions that are not running.
    pub async fn check_health(&self, id: &VersionId) -> Result<bool, VersionError> {
        let v = self.registry.require(id).await?;
        if !v.is_active() {
            return Ok(false);
        }
        Ok(process_alive(v.pid))
    }

    /// Stops everything that is running. Used on shutdown.
    pub async fn stop_all(&self) {
        for v in self.registry.list().await {
            if !v.is_active() {
                continue;
            }
            if let Err(err) = self.stop(&v.id).await {
                warn!(id = %v.id, error = %err, "failed to stop version on shutdown");
            }
        }
    }
}

async fn spawn(lease: &StartLease) -> Result<Child, VersionError> {
    let binary = &lease.binary_path;
    let meta = tokio::fs::metadata(binary).await.map_err(|_| {
        VersionError::ProcessSpawnFailed(format!("binary not found at {}", binary.display()))
    })?;
    if !meta.is_file() {
        return Err(VersionError::ProcessSpawnFailed(format!(
            "{} is not a file",
            binary.display()
        )));
    }

    let log_path = log_path_for(binary);
    logs::append_marker(&log_path, &format!("starting on port {}", lease.port))
        .await
        .map_err(|e| VersionError::ProcessSpawnFailed(format!("open {}: {e}", log_path.display())))?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| VersionError::ProcessSpawnFailed(format!("open {}: {e}", log_path.display())))?;
    let log_err = log
        .try_clone()
        .map_err(|e| VersionError::ProcessSpawnFailed(format!("dup log handle: {e}")))?;

    let mut cmd = tokio::process::Command::new(binary);
    cmd.args(["--serve", "--listen", &listen_arg(lease.port)])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(false);
    if let Some(dir) = binary.parent() {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
        .map_err(|e| VersionError::ProcessSpawnFailed(format!("{}: {e}", binary.display())))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{pid_exists, ready_version, test_config, wait_until, write_script};

    struct Fixture {
        dir: tempfile::TempDir,
        registry: Arc<Registry>,
        supervisor: Supervisor,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let registry = Arc::new(Registry::load(&config).await.unwrap());
        let supervisor = Supervisor::new(registry.clone(), &config);
        Fixture {
            dir,
            registry,
            supervisor,
        }
    }

    impl Fixture {
        async fn ready(&self, id: &str, script: &str) -> VersionId {
            let v = ready_version(id, self.dir.path());
            write_script(&v.binary_path, script);
            let slot = self.registry.reserve_slot().await.unwrap();
            self.registry.insert(slot, v).await.unwrap().id
        }

        async fn status(&self, id: &VersionId) -> AgentVersion {
            self.registry.get(id).await.unwrap()
        }
    }

    #[tokio::test]
    async fn start_records_process_and_passes_listen_flags() {
        let fx = fixture().await;
        let id = fx.ready("s1", "echo \"args: $*\"\nexec sleep 30").await;

        let v = fx.supervisor.start(&id).await.unwrap();
        assert_eq!(v.status, VersionStatus::Running);
        assert_eq!(v.port, 8081);
        assert!(v.pid > 0);
        assert!(v.process_fields_consistent());
        assert!(fx.supervisor.check_health(&id).await.unwrap());

        let log = fx.dir.path().join("s1/output.log");
        assert!(
            wait_until(Duration::from_secs(3), || async {
                std::fs::read_to_string(&log)
                    .unwrap_or_default()
                    .contains("args: --serve --listen :8081")
            })
            .await
        );

        let err = fx.supervisor.start(&id).await.unwrap_err();
        assert!(matches!(err, VersionError::AlreadyRunning { port: 8081, .. }));

        fx.supervisor.stop(&id).await.unwrap();
    }

    #[tokio::test]
    async fn out_of_band_kill_is_detected_as_failure() {
        let fx = fixture().await;
        let id = fx.ready("crash", "exec sleep 30").await;
        let v = fx.supervisor.start(&id).await.unwrap();

        unsafe {
            libc::kill(v.pid as libc::pid_t, libc::SIGKILL);
        }

        assert!(
            wait_until(Duration::from_secs(5), || async {
                fx.status(&id).await.status == VersionStatus::Failed
            })
            .await
        );
        let after = fx.status(&id).await;
        assert_eq!((after.pid, after.port), (0, 0));
        assert!(after.error.as_deref().unwrap().contains("signal 9"));
        assert!(!fx.supervisor.check_health(&id).await.unwrap());

        let on_disk = fx.registry.store().load(&id).await.unwrap().unwrap();
        assert_eq!(on_disk.status, VersionStatus::Failed);
    }

    #[tokio::test]
    async fn clean_exit_marks_stopped() {
        let fx = fixture().await;
        let id = fx.ready("clean", "sleep 0.2\nexit 0").await;
        fx.supervisor.start(&id).await.unwrap();

        assert!(
            wait_until(Duration::from_secs(5), || async {
                fx.status(&id).await.status == VersionStatus::Stopped
            })
            .await
        );
        let after = fx.status(&id).await;
        assert!(after.error.is_none());
        assert!(after.process_fields_consistent());
    }

    #[tokio::test]
    async fn stop_racing_a_natural_exit_ends_stopped() {
        let fx = fixture().await;
        for round in 0..5 {
            let id = fx.ready(&format!("race{round}"), "sleep 0.1\nexit 0").await;
            fx.supervisor.start(&id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(90)).await;

            match fx.supervisor.stop(&id).await {
                Ok(_) | Err(VersionError::NotRunning(_)) => {}
                Err(err) => panic!("unexpected stop error: {err}"),
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            let after = fx.status(&id).await;
            assert_eq!(after.status, VersionStatus::Stopped, "round {round}");
            assert!(after.process_fields_consistent());
            fx.registry.remove(&id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn stop_escalates_to_sigkill() {
        let fx = fixture().await;
        let id = fx
            .ready("stubborn", "trap '' TERM\nwhile true; do sleep 0.05; done")
            .await;
        let v = fx.supervisor.start(&id).await.unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopped = fx.supervisor.stop(&id).await.unwrap();
        assert_eq!(stopped.status, VersionStatus::Stopped);
        assert!(
            wait_until(Duration::from_secs(3), || async { !pid_exists(v.pid) }).await
        );
        assert_eq!(fx.status(&id).await.status, VersionStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_requires_running() {
        let fx = fixture().await;
        let id = fx.ready("idle", "exec sleep 30").await;
        let err = fx.supervisor.stop(&id).await.unwrap_err();
        assert!(matches!(err, VersionError::NotRunning(_)));
    }

    #[tokio::test]
    async fn restart_replaces_the_process() {
        let fx = fixture().await;
        let id = fx.ready("rs", "exec sleep 30").await;
        let first = fx.supervisor.start(&id).await.unwrap();

        let second = fx.supervisor.restart(&id).await.unwrap();
        assert_eq!(second.status, VersionStatus::Running);
        assert_ne!(first.pid, second.pid);
        assert!(wait_until(Duration::from_secs(3), || async { !pid_exists(first.pid) }).await);

        // The old monitor must not clobber the new instance.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let now = fx.status(&id).await;
        assert_eq!(now.status, VersionStatus::Running);
        assert_eq!(now.pid, second.pid);

        fx.supervisor.stop(&id).await.unwrap();
        let again = fx.supervisor.restart(&id).await.unwrap();
        assert_eq!(again.status, VersionStatus::Running);
        fx.supervisor.stop_all().await;
        assert_eq!(fx.status(&id).await.status, VersionStatus::Stopped);
    }

    #[tokio::test]
    async fn missing_binary_fails_without_state_change() {
        let fx = fixture().await;
        let v = ready_version("nobin", fx.dir.path());
        let slot = fx.registry.reserve_slot().await.unwrap();
        let id = fx.registry.insert(slot, v).await.unwrap().id;

        let err = fx.supervisor.start(&id).await.unwrap_err();
        assert!(matches!(err, VersionError::ProcessSpawnFailed(_)));
        let after = fx.status(&id).await;
        assert_eq!(after.status, VersionStatus::Ready);
        assert!(after.error.as_deref().unwrap().contains("binary not found"));
        assert_eq!(fx.registry.allocate_port().await, 8081);
    }

    #[tokio::test]
    async fn exhausted_ports_reject_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_port = config.base_port;
        let registry = Arc::new(Registry::load(&config).await.unwrap());
        let supervisor = Supervisor::new(registry.clone(), &config);

        for id in ["p1", "p2"] {
            let v = ready_version(id, dir.path());
            write_script(&v.binary_path, "exec sleep 30");
            let slot = registry.reserve_slot().await.unwrap();
            registry.insert(slot, v).await.unwrap();
        }
        let p1 = VersionId("p1".into());
        let p2 = VersionId("p2".into());
        supervisor.start(&p1).await.unwrap();

        let err = supervisor.start(&p2).await.unwrap_err();
        assert!(matches!(err, VersionError::NoPortsAvailable { .. }));
        assert_eq!(registry.get(&p2).await.unwrap().status, VersionStatus::Ready);
        supervisor.stop_all().await;
    }

    #[test]
    fn exit_descriptions() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            describe_exit(&Ok(ExitStatus::from_raw(0))),
            (true, "exited cleanly".to_string())
        );
        assert_eq!(
            describe_exit(&Ok(ExitStatus::from_raw(3 << 8))),
            (false, "exited with code 3".to_string())
        );
        assert_eq!(
            describe_exit(&Ok(ExitStatus::from_raw(9))),
            (false, "terminated by signal 9".to_string())
        );
    }
}
