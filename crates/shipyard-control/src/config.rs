use std::{
    net::SocketAddr,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};

use shipyard_version::VersionId;

pub const DEFAULT_BASE_PORT: u16 = 8081;
pub const DEFAULT_MAX_PORT: u16 = 8090;
pub const DEFAULT_MAX_VERSIONS: usize = 5;
pub const DEFAULT_BINARY_NAME: &str = "agent";
pub const DEFAULT_BUILD_COMMAND: &str =
    "cargo build --release && cp target/release/agent \"$SHIPYARD_BUILD_OUTPUT\"";

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "output.log";

/// Runtime settings for the control plane.
///
/// Read once at boot from `SHIPYARD_*` variables; tests build it directly
/// with [`ControlConfig::with_data_dir`].
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub data_dir: PathBuf,
    /// Shared working tree. `None` disables branch management and builds.
    pub repo_dir: Option<PathBuf>,
    pub base_port: u16,
    pub max_port: u16,
    pub max_versions: usize,
    pub main_domain: String,
    pub listen: SocketAddr,
    pub binary_name: String,
    /// Run through `sh -c` inside the working tree.
    pub build_command: String,
    pub build_timeout: Duration,
    pub restart_grace: Duration,
    pub stop_timeout: Duration,
    /// Log tails are bounded to roughly this many bytes per requested line.
    pub log_bytes_per_line: usize,
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_u16(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u16> {
    lookup(name).and_then(|v| v.trim().parse::<u16>().ok())
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("shipyard")
        .join("versions")
}

impl ControlConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            repo_dir: None,
            base_port: DEFAULT_BASE_PORT,
            max_port: DEFAULT_MAX_PORT,
            max_versions: DEFAULT_MAX_VERSIONS,
            main_domain: "localhost".to_string(),
            listen: ([0, 0, 0, 0], 8080).into(),
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            build_command: DEFAULT_BUILD_COMMAND.to_string(),
            build_timeout: Duration::from_secs(600),
            restart_grace: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(5),
            log_bytes_per_line: 100,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_dir = non_empty(&lookup, "SHIPYARD_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut cfg = Self::with_data_dir(data_dir);

        cfg.repo_dir = non_empty(&lookup, "SHIPYARD_REPO_DIR").map(PathBuf::from);
        if let Some(p) = parse_u16(&lookup, "SHIPYARD_BASE_PORT") {
            cfg.base_port = p;
        }
        if let Some(p) = parse_u16(&lookup, "SHIPYARD_MAX_PORT") {
            cfg.max_port = p;
        }
        if let Some(n) = parse_u64(&lookup, "SHIPYARD_MAX_VERSIONS") {
            cfg.max_versions = n.clamp(1, 64) as usize;
        }
        if let Some(d) = non_empty(&lookup, "SHIPYARD_MAIN_DOMAIN") {
            cfg.main_domain = d.trim_matches('.').to_ascii_lowercase();
        }
        if let Some(raw) = non_empty(&lookup, "SHIPYARD_LISTEN") {
            cfg.listen = raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SHIPYARD_LISTEN {raw:?}: {e}"))?;
        }
        if let Some(name) = non_empty(&lookup, "SHIPYARD_BINARY_NAME") {
            cfg.binary_name = name;
        }
        if let Some(cmd) = non_empty(&lookup, "SHIPYARD_BUILD_COMMAND") {
            cfg.build_command = cmd;
        }
        if let Some(secs) = parse_u64(&lookup, "SHIPYARD_BUILD_TIMEOUT_SEC") {
            cfg.build_timeout = Duration::from_secs(secs.clamp(10, 6 * 60 * 60));
        }
        if let Some(ms) = parse_u64(&lookup, "SHIPYARD_RESTART_GRACE_MS") {
            cfg.restart_grace = Duration::from_millis(ms.clamp(0, 60_000));
        }
        if let Some(ms) = parse_u64(&lookup, "SHIPYARD_STOP_TIMEOUT_MS") {
            cfg.stop_timeout = Duration::from_millis(ms.clamp(100, 120_000));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_port == 0 || self.max_port == 0 {
            anyhow::bail!("port range must not include port 0");
        }
        if self.base_port > self.max_port {
            anyhow::bail!(
                "invalid port range: base {} > max {}",
                self.base_port,
                self.max_port
            );
        }
        if self.max_versions == 0 {
            anyhow::bail!("max_versions must be at least 1");
        }
        if self.binary_name.contains('/') || self.binary_name.is_empty() {
            anyhow::bail!("invalid binary name: {:?}", self.binary_name);
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.base_port..=self.max_port
    }

    pub fn version_dir(&self, id: &VersionId) -> PathBuf {
        self.data_dir.join(id.as_str())
    }

    pub fn binary_path(&self, id: &VersionId) -> PathBuf {
        self.version_dir(id).join(&self.binary_name)
    }

    pub fn log_path(&self, id: &VersionId) -> PathBuf {
        self.version_dir(id).join(LOG_FILE)
    }

    pub fn meta_path(data_dir: &Path, id: &VersionId) -> PathBuf {
        data_dir.join(id.as_str()).join(META_FILE)
    }
}
