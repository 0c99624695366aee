use std::sync::Arc;

use shipyard_version::{AgentVersion, VersionId, VersionStatus};
use tracing::{info, instrument, warn};

use crate::{
    build::BuildPipeline,
    config::ControlConfig,
    error::{VersionError, format_error_chain},
    logs,
    registry::Registry,
    supervisor::Supervisor,
    vcs::{self, Vcs, normalize_rel_path},
};

const MAX_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 2000;

/// Compact listing entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionSummary {
    pub id: VersionId,
    pub name: String,
    pub status: VersionStatus,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&AgentVersion> for VersionSummary {
    fn from(v: &AgentVersion) -> Self {
        Self {
            id: v.id.clone(),
            name: v.name.clone(),
            status: v.status,
            port: v.port,
            error: v.error.clone(),
        }
    }
}

/// Entry point for every lifecycle operation.
pub struct VersionManager {
    config: ControlConfig,
    registry: Arc<Registry>,
    builds: BuildPipeline,
    supervisor: Supervisor,
}

impl VersionManager {
    pub async fn open(config: ControlConfig, vcs: Option<Arc<dyn Vcs>>) -> anyhow::Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::load(&config).await?);
        let builds = BuildPipeline::new(registry.clone(), vcs, &config);
        let supervisor = Supervisor::new(registry.clone(), &config);
        Ok(Self {
            config,
            registry,
            builds,
            supervisor,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[instrument(skip(self, description))]
    pub async fn create_version(
        &self,
        name: &str,
        description: &str,
    ) -> Result<AgentVersion, VersionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VersionError::InvalidInput("name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(VersionError::InvalidInput(format!(
                "name must be at most {MAX_NAME_LEN} bytes"
            )));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(VersionError::InvalidInput(format!(
                "description must be at most {MAX_DESCRIPTION_LEN} bytes"
            )));
        }

        let slot = self.registry.reserve_slot().await?;

        let mut id = VersionId::new();
        while self.registry.get(&id).await.is_some() || self.registry.store().exists(&id).await {
            id = VersionId::new();
        }
        let mut v = AgentVersion::new(
            id.clone(),
            name,
            description.trim(),
            self.config.binary_path(&id),
        );

        self.registry
            .store()
            .ensure_version_dir(&id)
            .await
            .map_err(VersionError::Store)?;

        if let Some(vcs) = self.builds.vcs().cloned() {
            let _tree = self.builds.lock_working_tree().await;
            let branch = v.branch.clone();
            let created = vcs::blocking(vcs, move |vcs| {
                vcs.create_branch(&branch)?;
                Ok(vcs.current_commit())
            })
            .await;
            match created {
                Ok(commit) => v.commit_hash = commit,
                Err(err) => {
                    if let Err(e) = self.registry.store().delete(&id).await {
                        warn!(%id, error = %format!("{e:#}"), "failed to clean up version dir");
                    }
                    return Err(VersionError::Vcs(format_error_chain(&err)));
                }
            }
        }

        let v = match self.registry.insert(slot, v).await {
            Ok(v) => v,
            Err(err) => {
                if let Err(e) = self.registry.store().delete(&id).await {
                    warn!(%id, error = %format!("{e:#}"), "failed to clean up version dir");
                }
                return Err(err);
            }
        };
        info!(id = %v.id, branch = %v.branch, "version created");
        Ok(v)
    }

    pub async fn get_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.registry.require(id).await
    }

    pub async fn list_versions(&self) -> Vec<AgentVersion> {
        self.registry.list().await
    }

    pub async fn list_summaries(&self) -> Vec<VersionSummary> {
        self.registry
            .list()
            .await
            .iter()
            .map(VersionSummary::from)
            .collect()
    }

    /// One line per version, for terminals.
    pub async fn status_text(&self) -> String {
        let versions = self.registry.list().await;
        if versions.is_empty() {
            return "no versions\n".to_string();
        }
        let mut out = String::new();
        for v in versions {
            out.push_str(&v.summary_line());
            out.push('\n');
        }
        out
    }

    pub async fn build_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.builds.build(id).await
    }

    /// Stops the version if needed, then builds it again.
    pub async fn rebuild_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let v = self.registry.require(id).await?;
        if v.is_active() {
            self.stop_quietly(id).await?;
        }
        self.builds.rebuild(id).await
    }

    pub async fn start_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.supervisor.start(id).await
    }

    pub async fn stop_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.supervisor.stop(id).await
    }

    pub async fn restart_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        self.supervisor.restart(id).await
    }

    async fn stop_quietly(&self, id: &VersionId) -> Result<(), VersionError> {
        match self.supervisor.stop(id).await {
            Ok(_) | Err(VersionError::NotRunning(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Stops a running process, then removes the record, its directory and
    /// its branch.
    #[instrument(skip(self))]
    pub async fn delete_version(&self, id: &VersionId) -> Result<AgentVersion, VersionError> {
        let v = self.registry.require(id).await?;
        if v.is_active() {
            self.stop_quietly(id).await?;
        }
        let removed = self.registry.remove(id).await?;

        if let Some(vcs) = self.builds.vcs().cloned() {
            let _tree = self.builds.lock_working_tree().await;
            let branch = removed.branch.clone();
            if let Err(err) = vcs::blocking(vcs, move |vcs| vcs.delete_branch(&branch)).await {
                warn!(%id, branch = %removed.branch, error = %format_error_chain(&err), "failed to delete branch");
            }
        }
        info!(%id, "version deleted");
        Ok(removed)
    }

    /// Tail of the version's process output.
    pub async fn version_logs(&self, id: &VersionId, lines: usize) -> Result<String, VersionError> {
        self.registry.require(id).await?;
        let text = logs::read_tail(
            &self.config.log_path(id),
            lines,
            self.config.log_bytes_per_line,
        )
        .await?;
        Ok(text)
    }

    pub async fn check_health(&self, id: &VersionId) -> Result<bool, VersionError> {
        self.supervisor.check_health(id).await
    }

    /// Writes one file on the version's branch in the shared working tree.
    #[instrument(skip(self, content))]
    pub async fn apply_changes(
        &self,
        id: &VersionId,
        path: &str,
        content: &str,
    ) -> Result<AgentVersion, VersionError> {
        let v = self.registry.require(id).await?;
        normalize_rel_path(path).map_err(|e| VersionError::InvalidInput(e.to_string()))?;
        let Some(vcs) = self.builds.vcs().cloned() else {
            return Err(VersionError::Vcs("repository not initialized".into()));
        };

        let _tree = self.builds.lock_working_tree().await;
        let branch = v.branch.clone();
        let rel = path.to_string();
        let content = content.to_string();
        vcs::blocking(vcs, move |vcs| {
            vcs.checkout(&branch)?;
            vcs.write_file(&rel, &content)
        })
        .await
        .map_err(|e| VersionError::Vcs(format_error_chain(&e)))?;

        info!(%id, path, "changes applied");
        Ok(v)
    }

    pub async fn allocate_port(&self) -> u16 {
        self.registry.allocate_port().await
    }

    /// Stops every running version.
    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }
}
