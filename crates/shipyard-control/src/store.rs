use std::path::PathBuf;

use anyhow::Context;
use shipyard_version::{AgentVersion, VersionId};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::config::ControlConfig;

/// One directory per version under `dir`, each holding a `meta.json`.
///
/// Writes are serialized internally; consistency across records is not
/// attempted.
#[derive(Debug)]
pub struct VersionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl VersionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create versions dir {}", dir.display()))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn version_dir(&self, id: &VersionId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    pub async fn ensure_version_dir(&self, id: &VersionId) -> anyhow::Result<PathBuf> {
        let dir = self.version_dir(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create version dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Rewrites `meta.json` wholesale via a temp file and rename.
    pub async fn save(&self, v: &AgentVersion) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;

        let dir = self.ensure_version_dir(&v.id).await?;
        let path = ControlConfig::meta_path(&self.dir, &v.id);
        let tmp = dir.join("meta.json.tmp");
        let data = serde_json::to_vec_pretty(v).context("serialize meta.json")?;

        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create meta.json.tmp")?;
        f.write_all(&data).await.context("write meta.json.tmp")?;
        f.flush().await.context("flush meta.json.tmp")?;
        drop(f);

        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist meta.json")?;
        Ok(())
    }

    pub async fn load(&self, id: &VersionId) -> anyhow::Result<Option<AgentVersion>> {
        let path = ControlConfig::meta_path(&self.dir, id);
        let raw = match tokio::fs::read(&path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let v = serde_json::from_slice::<AgentVersion>(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(v))
    }

    /// Loads every readable record; unreadable directories are skipped.
    pub async fn load_all(&self) -> anyhow::Result<Vec<AgentVersion>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("read versions dir"),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.context("read versions dir")? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(VersionId::parse) else {
                continue;
            };
            match self.load(&id).await {
                Ok(Some(v)) if v.id == id => out.push(v),
                Ok(Some(v)) => {
                    tracing::warn!(dir = %id, id = %v.id, "skipping version whose id does not match its directory");
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(%id, error = %format!("{err:#}"), "skipping unreadable version record");
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    /// Removes the whole version directory (record, log, artifact).
    pub async fn delete(&self, id: &VersionId) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let dir = self.version_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("delete {}", dir.display())),
        }
    }

    pub async fn exists(&self, id: &VersionId) -> bool {
        tokio::fs::metadata(ControlConfig::meta_path(&self.dir, id))
            .await
            .is_ok()
    }
}
