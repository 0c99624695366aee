use std::{
    collections::HashMap,
    ops::RangeInclusive,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use shipyard_version::{AgentVersion, Transition, VersionId, VersionStatus};
use tokio::sync::{Mutex, broadcast};

use crate::{config::ControlConfig, error::VersionError, store::VersionStore};

const STOP_EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct RegistryState {
    versions: HashMap<VersionId, AgentVersion>,
    /// Ports handed to in-flight starts that have not recorded a pid yet.
    leases: HashMap<u16, VersionId>,
}

impl RegistryState {
    fn lease_for(&self, id: &VersionId) -> Option<u16> {
        self.leases
            .iter()
            .find_map(|(port, owner)| (owner == id).then_some(*port))
    }
}

/// Lowest port in `range` not held by a record or an in-flight start; `0` when
/// the range is exhausted.
fn lowest_free_port(
    versions: &HashMap<VersionId, AgentVersion>,
    leases: &HashMap<u16, VersionId>,
    range: RangeInclusive<u16>,
) -> u16 {
    range
        .into_iter()
        .find(|port| {
            !leases.contains_key(port) && !versions.values().any(|v| v.port != 0 && v.port == *port)
        })
        .unwrap_or(0)
}

/// Applies `t` to `v`, mapping a rejection to [`VersionError::InvalidTransition`].
pub fn step(v: &mut AgentVersion, t: Transition) -> Result<(), VersionError> {
    let id = v.id.clone();
    v.transition(t).map_err(|r| VersionError::rejected(&id, r))
}

/// Holds one of the `max_versions` slots while a create is in flight.
///
/// Dropping it without [`Registry::insert`] gives the slot back.
#[derive(Debug)]
pub struct SlotReservation<'a> {
    registry: &'a Registry,
    armed: bool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.pending_creates.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A port reserved for one version between allocation and spawn.
#[derive(Debug, Clone)]
pub struct StartLease {
    pub id: VersionId,
    pub port: u16,
    pub binary_path: PathBuf,
}

/// Authoritative in-memory version table plus port allocator.
///
/// One lock guards both. Every committed mutation is written through to the
/// [`VersionStore`] before the lock is released.
#[derive(Debug)]
pub struct Registry {
    state: Mutex<RegistryState>,
    store: VersionStore,
    ports: RangeInclusive<u16>,
    max_versions: usize,
    pending_creates: AtomicUsize,
    stopped_tx: broadcast::Sender<VersionId>,
}

impl Registry {
    /// Opens the store and rebuilds the table from disk.
    ///
    /// A control-plane restart kills nothing it does not own, but it also
    /// cannot re-attach to processes, so `Running` records are reset to
    /// `Stopped` and interrupted builds to `Failed`.
    pub async fn load(config: &ControlConfig) -> anyhow::Result<Self> {
        let store = VersionStore::open(&config.data_dir).await?;
        let mut versions = HashMap::new();

        for mut v in store.load_all().await? {
            let mut dirty = v.reconcile_after_restart();
            if v.status == VersionStatus::Building {
                v.status = VersionStatus::Failed;
                v.error = Some("build interrupted by control plane restart".to_string());
                dirty = true;
            }
            if dirty {
                tracing::info!(id = %v.id, status = %v.status, "reconciled stale version state");
                if let Err(err) = store.save(&v).await {
                    tracing::warn!(id = %v.id, error = %format!("{err:#}"), "failed to persist reconciled state");
                }
            }
            versions.insert(v.id.clone(), v);
        }

        let (stopped_tx, _) = broadcast::channel(STOP_EVENTS_CAPACITY);
        Ok(Self {
            state: Mutex::new(RegistryState {
                versions,
                leases: HashMap::new(),
            }),
            store,
            ports: config.port_range(),
            max_versions: config.max_versions,
            pending_creates: AtomicUsize::new(0),
            stopped_tx,
        })
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Ids of versions that stopped serving (stop, crash or delete).
    pub fn subscribe_stopped(&self) -> broadcast::Receiver<VersionId> {
        self.stopped_tx.subscribe()
    }

    fn notify_stopped(&self, id: &VersionId) {
        // No receivers is fine.
        let _ = self.stopped_tx.send(id.clone());
    }

    pub async fn get(&self, id: &VersionId) -> Option<AgentVersion> {
        self.state.lock().await.versions.get(id).cloned()
    }

    pub async fn require(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.get(id)
            .await
            .ok_or_else(|| VersionError::NotFound(id.clone()))
    }

    /// Snapshot ordered by creation time.
    pub async fn list(&self) -> Vec<AgentVersion> {
        let mut out: Vec<_> = self.state.lock().await.versions.values().cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.versions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Claims a version slot, failing when records plus in-flight creates
    /// already reach the ceiling.
    pub async fn reserve_slot(&self) -> Result<SlotReservation<'_>, VersionError> {
        let st = self.state.lock().await;
        let in_flight = self.pending_creates.load(Ordering::SeqCst);
        if st.versions.len() + in_flight >= self.max_versions {
            return Err(VersionError::CapacityExceeded {
                max: self.max_versions,
            });
        }
        self.pending_creates.fetch_add(1, Ordering::SeqCst);
        Ok(SlotReservation {
            registry: self,
            armed: true,
        })
    }

    /// Persists and publishes a new record, consuming its slot.
    pub async fn insert(
        &self,
        mut slot: SlotReservation<'_>,
        v: AgentVersion,
    ) -> Result<AgentVersion, VersionError> {
        let mut st = self.state.lock().await;
        self.store.save(&v).await.map_err(VersionError::Store)?;
        st.versions.insert(v.id.clone(), v.clone());
        // Counted in `versions` now; release the in-flight slot under the lock.
        slot.armed = false;
        self.pending_creates.fetch_sub(1, Ordering::SeqCst);
        Ok(v)
    }

    /// Applies `f` to a copy of the record, persists it, then publishes it.
    ///
    /// When `f` or the write fails the in-memory record is left untouched.
    pub async fn update<F>(&self, id: &VersionId, f: F) -> Result<AgentVersion, VersionError>
    where
        F: FnOnce(&mut AgentVersion) -> Result<(), VersionError>,
    {
        let mut st = self.state.lock().await;
        let current = st
            .versions
            .get(id)
            .ok_or_else(|| VersionError::NotFound(id.clone()))?;
        let was_running = current.status == VersionStatus::Running;

        let mut next = current.clone();
        f(&mut next)?;
        self.store.save(&next).await.map_err(VersionError::Store)?;

        let left_running = was_running && next.status != VersionStatus::Running;
        st.versions.insert(id.clone(), next.clone());
        drop(st);

        if left_running {
            self.notify_stopped(id);
        }
        Ok(next)
    }

    /// Like [`Registry::update`], but the in-memory change always lands and a
    /// failed write is only logged. Used by background tasks that have no
    /// caller to report to. `f` returns whether it changed anything.
    pub async fn update_best_effort<F>(&self, id: &VersionId, f: F) -> Option<AgentVersion>
    where
        F: FnOnce(&mut AgentVersion) -> bool,
    {
        let mut st = self.state.lock().await;
        let v = st.versions.get_mut(id)?;
        let was_running = v.status == VersionStatus::Running;
        if !f(v) {
            return None;
        }
        let snapshot = v.clone();
        if let Err(err) = self.store.save(&snapshot).await {
            tracing::warn!(%id, error = %format!("{err:#}"), "failed to persist version state");
        }
        drop(st);

        if was_running && snapshot.status != VersionStatus::Running {
            self.notify_stopped(id);
        }
        Some(snapshot)
    }

    /// Lowest free port in the configured range, or `0` when none is free.
    pub async fn allocate_port(&self) -> u16 {
        let st = self.state.lock().await;
        lowest_free_port(&st.versions, &st.leases, self.ports.clone())
    }

    /// Validates that `id` may start and reserves a port for it.
    ///
    /// Must be followed by [`Registry::commit_start`] or
    /// [`Registry::abort_start`].
    pub async fn begin_start(&self, id: &VersionId) -> Result<StartLease, VersionError> {
        let mut st = self.state.lock().await;
        let v = st
            .versions
            .get(id)
            .ok_or_else(|| VersionError::NotFound(id.clone()))?;

        if v.is_active() {
            return Err(VersionError::AlreadyRunning {
                id: id.clone(),
                port: v.port,
            });
        }
        if let Some(port) = st.lease_for(id) {
            return Err(VersionError::AlreadyRunning {
                id: id.clone(),
                port,
            });
        }
        v.status
            .apply(Transition::Launch)
            .map_err(|r| VersionError::rejected(id, r))?;

        let binary_path = v.binary_path.clone();
        let port = lowest_free_port(&st.versions, &st.leases, self.ports.clone());
        if port == 0 {
            return Err(VersionError::NoPortsAvailable {
                base: *self.ports.start(),
                max: *self.ports.end(),
            });
        }
        st.leases.insert(port, id.clone());

        Ok(StartLease {
            id: id.clone(),
            port,
            binary_path,
        })
    }

    /// Records a spawned process. On error the lease is released and the
    /// caller must kill `pid`.
    pub async fn commit_start(
        &self,
        lease: &StartLease,
        pid: u32,
    ) -> Result<AgentVersion, VersionError> {
        let mut st = self.state.lock().await;
        st.leases.remove(&lease.port);

        let current = st
            .versions
            .get(&lease.id)
            .ok_or_else(|| VersionError::NotFound(lease.id.clone()))?;
        let mut next = current.clone();
        next.mark_running(pid, lease.port)
            .map_err(|r| VersionError::rejected(&lease.id, r))?;
        self.store.save(&next).await.map_err(VersionError::Store)?;
        st.versions.insert(lease.id.clone(), next.clone());
        Ok(next)
    }

    /// Releases a lease after a failed spawn, recording `error` if given.
    pub async fn abort_start(&self, lease: &StartLease, error: Option<String>) {
        let mut st = self.state.lock().await;
        st.leases.remove(&lease.port);
        let Some(v) = st.versions.get_mut(&lease.id) else {
            return;
        };
        if let Some(msg) = error {
            v.error = Some(msg);
            let snapshot = v.clone();
            if let Err(err) = self.store.save(&snapshot).await {
                tracing::warn!(id = %lease.id, error = %format!("{err:#}"), "failed to persist start failure");
            }
        }
    }

    /// Removes a record and its on-disk directory.
    ///
    /// Refuses while the version is running, starting or building; callers
    /// stop it first.
    pub async fn remove(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let mut st = self.state.lock().await;
        let v = st
            .versions
            .get(id)
            .ok_or_else(|| VersionError::NotFound(id.clone()))?;

        if v.is_active() {
            return Err(VersionError::AlreadyRunning {
                id: id.clone(),
                port: v.port,
            });
        }
        if let Some(port) = st.lease_for(id) {
            return Err(VersionError::AlreadyRunning {
                id: id.clone(),
                port,
            });
        }
        if !v.status.permits(Transition::Delete) {
            return Err(VersionError::InvalidTransition {
                id: id.clone(),
                status: v.status,
                action: Transition::Delete,
            });
        }

        let removed = st
            .versions
            .remove(id)
            .ok_or_else(|| VersionError::NotFound(id.clone()))?;
        drop(st);

        // The directory holds the binary and logs; removing it is slow disk
        // work and happens outside the lock.
        if let Err(err) = self.store.delete(id).await {
            self.state
                .lock()
                .await
                .versions
                .insert(id.clone(), removed);
            return Err(VersionError::Store(err));
        }

        self.notify_stopped(id);
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) async fn put(&self, v: AgentVersion) {
        self.state.lock().await.versions.insert(v.id.clone(), v);
    }
}
