use std::fmt;

use chrono::{DateTime, Utc};

/// Upper bound for the sanitized part of a branch name.
pub const BRANCH_NAME_MAX: usize = 20;

const ID_LEN: usize = 8;

/// Short, path- and subdomain-safe version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub String);

impl VersionId {
    pub fn new() -> Self {
        let mut raw = uuid::Uuid::new_v4().simple().to_string();
        raw.truncate(ID_LEN);
        Self(raw)
    }

    /// Accepts ids coming from URLs and hostnames.
    ///
    /// Only ASCII alphanumerics, `-` and `_` are allowed so an id can never
    /// escape its directory under the data root.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > 64 {
            return None;
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    /// Created, never built.
    Pending,
    Building,
    /// Built and startable.
    Ready,
    Running,
    /// Last build or run failed; `error` carries the cause.
    Failed,
    Stopped,
}

impl VersionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Pending => "pending",
            VersionStatus::Building => "building",
            VersionStatus::Ready => "ready",
            VersionStatus::Running => "running",
            VersionStatus::Failed => "failed",
            VersionStatus::Stopped => "stopped",
        }
    }

    pub fn permits(self, transition: Transition) -> bool {
        transition.sources().contains(&self)
    }

    /// Returns the status reached by `transition`, or the rejected pair.
    ///
    /// `Delete` has no target status and is always rejected here; check it
    /// with `permits`.
    pub fn apply(self, transition: Transition) -> Result<VersionStatus, TransitionRejected> {
        match transition.target() {
            Some(target) if self.permits(transition) => Ok(target),
            _ => Err(TransitionRejected {
                from: self,
                transition,
            }),
        }
    }

    pub fn is_buildable(self) -> bool {
        self.permits(Transition::BeginBuild)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every status change a version can go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    BeginBuild,
    /// Build again after an explicit stop; also accepts stopped versions.
    Rebuild,
    BuildSucceeded,
    BuildFailed,
    Launch,
    Stop,
    ExitedCleanly,
    ExitedAbnormally,
    Delete,
}

impl Transition {
    /// Statuses a version may be in for this transition to be accepted.
    pub fn sources(self) -> &'static [VersionStatus] {
        use VersionStatus::*;
        match self {
            Transition::BeginBuild => &[Pending, Failed, Ready],
            Transition::Rebuild => &[Pending, Failed, Ready, Stopped],
            Transition::BuildSucceeded | Transition::BuildFailed => &[Building],
            Transition::Launch => &[Ready, Stopped],
            Transition::Stop | Transition::ExitedCleanly | Transition::ExitedAbnormally => {
                &[Running]
            }
            Transition::Delete => &[Pending, Ready, Failed, Stopped],
        }
    }

    /// Status a version ends up in. `None` for `Delete`: the record is removed.
    pub fn target(self) -> Option<VersionStatus> {
        use VersionStatus::*;
        Some(match self {
            Transition::BeginBuild | Transition::Rebuild => Building,
            Transition::BuildSucceeded => Ready,
            Transition::BuildFailed | Transition::ExitedAbnormally => Failed,
            Transition::Launch => Running,
            Transition::Stop | Transition::ExitedCleanly => Stopped,
            Transition::Delete => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Transition::BeginBuild => "build",
            Transition::Rebuild => "rebuild",
            Transition::BuildSucceeded => "build_succeeded",
            Transition::BuildFailed => "build_failed",
            Transition::Launch => "start",
            Transition::Stop => "stop",
            Transition::ExitedCleanly => "exit",
            Transition::ExitedAbnormally => "crash",
            Transition::Delete => "delete",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRejected {
    pub from: VersionStatus,
    pub transition: Transition,
}

impl fmt::Display for TransitionRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} a version in status {}", self.transition, self.from)
    }
}

impl std::error::Error for TransitionRejected {}

/// One build/run unit. Persisted verbatim as `meta.json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentVersion {
    pub id: VersionId,
    pub name: String,
    pub branch: String,
    #[serde(default)]
    pub commit_hash: String,
    pub binary_path: std::path::PathBuf,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub pid: u32,
    pub status: VersionStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl AgentVersion {
    pub fn new(
        id: VersionId,
        name: impl Into<String>,
        description: impl Into<String>,
        binary_path: std::path::PathBuf,
    ) -> Self {
        let name = name.into();
        let branch = branch_name(&id, &name);
        Self {
            id,
            name,
            branch,
            commit_hash: String::new(),
            binary_path,
            port: 0,
            pid: 0,
            status: VersionStatus::Pending,
            description: description.into(),
            error: None,
            created_at: Utc::now(),
            built_at: None,
            started_at: None,
        }
    }

    /// A process is attached and serving.
    pub fn is_active(&self) -> bool {
        self.status == VersionStatus::Running && self.pid > 0
    }

    pub fn transition(&mut self, t: Transition) -> Result<(), TransitionRejected> {
        self.status = self.status.apply(t)?;
        Ok(())
    }

    pub fn mark_running(&mut self, pid: u32, port: u16) -> Result<(), TransitionRejected> {
        self.transition(Transition::Launch)?;
        self.pid = pid;
        self.port = port;
        self.started_at = Some(Utc::now());
        self.error = None;
        Ok(())
    }

    pub fn clear_process(&mut self) {
        self.pid = 0;
        self.port = 0;
    }

    /// `pid != 0`, `port != 0` and `status == Running` must agree.
    pub fn process_fields_consistent(&self) -> bool {
        let running = self.status == VersionStatus::Running;
        (self.pid != 0) == running && (self.port != 0) == running
    }

    /// Boot-time repair: nothing survives a restart of the control plane.
    pub fn reconcile_after_restart(&mut self) -> bool {
        if self.status != VersionStatus::Running {
            return false;
        }
        self.status = VersionStatus::Stopped;
        self.clear_process();
        true
    }

    pub fn summary_line(&self) -> String {
        let mut line = format!("{} [{}] - {}", self.id, self.status, self.name);
        if self.port > 0 {
            line.push_str(&format!(" (port {})", self.port));
        }
        line
    }
}

/// Derives the VCS branch for a version.
///
/// Keeps ASCII alphanumerics and `-`, folds spaces to `-`, drops everything
/// else, and bounds the result. The id prefix keeps branches unique even when
/// two versions share a name.
pub fn branch_name(id: &VersionId, name: &str) -> String {
    let mut slug = String::with_capacity(name.len().min(BRANCH_NAME_MAX));
    for c in name.chars() {
        if slug.len() >= BRANCH_NAME_MAX {
            break;
        }
        if c.is_ascii_alphanumeric() || c == '-' {
            slug.push(c);
        } else if c == ' ' {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        format!("version-{id}")
    } else {
        format!("version-{id}-{slug}")
    }
}
