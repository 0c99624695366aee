use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use shipyard_version::{Transition, TransitionRejected, VersionId, VersionStatus};

/// Upper bound for error text stored on a version or returned to clients.
pub const MAX_ERROR_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    #[error("version {0} not found")]
    NotFound(VersionId),

    #[error("maximum versions ({max}) reached, delete some first")]
    CapacityExceeded { max: usize },

    #[error("no available ports (all {base}-{max} in use)")]
    NoPortsAvailable { base: u16, max: u16 },

    #[error("version {id} cannot {action} (status: {status})")]
    InvalidTransition {
        id: VersionId,
        status: VersionStatus,
        action: Transition,
    },

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("failed to start version: {0}")]
    ProcessSpawnFailed(String),

    #[error("version {id} is already running on port {port}")]
    AlreadyRunning { id: VersionId, port: u16 },

    #[error("version {0} is not running")]
    NotRunning(VersionId),

    #[error("source control: {0}")]
    Vcs(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error("failed to persist version state: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VersionError {
    pub fn rejected(id: &VersionId, rejected: TransitionRejected) -> Self {
        VersionError::InvalidTransition {
            id: id.clone(),
            status: rejected.from,
            action: rejected.transition,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            VersionError::NotFound(_) => "not_found",
            VersionError::CapacityExceeded { .. } => "capacity_exceeded",
            VersionError::NoPortsAvailable { .. } => "no_ports_available",
            VersionError::InvalidTransition { .. } => "invalid_transition",
            VersionError::BuildFailed(_) => "build_failed",
            VersionError::ProcessSpawnFailed(_) => "process_spawn_failed",
            VersionError::AlreadyRunning { .. } => "already_running",
            VersionError::NotRunning(_) => "not_running",
            VersionError::Vcs(_) => "vcs_failed",
            VersionError::InvalidInput(_) => "invalid_input",
            VersionError::Store(_) => "store_failed",
            VersionError::Io(_) => "io_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            VersionError::NotFound(_) => StatusCode::NOT_FOUND,
            VersionError::CapacityExceeded { .. }
            | VersionError::InvalidTransition { .. }
            | VersionError::AlreadyRunning { .. }
            | VersionError::NotRunning(_) => StatusCode::CONFLICT,
            VersionError::NoPortsAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            VersionError::BuildFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            VersionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            VersionError::ProcessSpawnFailed(_)
            | VersionError::Vcs(_)
            | VersionError::Store(_)
            | VersionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let message = truncate_utf8(&message.into(), MAX_ERROR_BYTES);
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message,
        }),
    )
        .into_response()
}

impl IntoResponse for VersionError {
    fn into_response(self) -> Response {
        if self.status_code().is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        }
        json_error(self.status_code(), self.code(), self.to_string())
    }
}

pub fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// Keeps the *end* of long output, where build tools print the actual failure.
pub fn truncate_utf8_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let prefix = "(truncated)…";
    let keep = max_bytes.saturating_sub(prefix.len()).max(1);
    let mut start = s.len().saturating_sub(keep);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("{prefix}{}", &s[start..])
}

pub fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(100);
        let out = truncate_utf8(&s, 21);
        assert!(out.len() <= 21 + 2);
        assert!(out.ends_with("…(truncated)"));

        let tail = truncate_utf8_tail(&s, 21);
        assert!(tail.starts_with("(truncated)…"));
        assert!(tail.ends_with('é'));
    }

    #[test]
    fn short_strings_pass_through() {
        assert_eq!(truncate_utf8("ok", 10), "ok");
        assert_eq!(truncate_utf8_tail("ok", 10), "ok");
    }

    #[test]
    fn error_chain_dedupes_repeated_causes() {
        let err = anyhow::anyhow!("disk full")
            .context("write meta.json")
            .context("write meta.json");
        assert_eq!(format_error_chain(&err), "write meta.json: disk full");
    }

    #[test]
    fn invalid_transition_message_names_the_action() {
        let id = VersionId("v1".to_string());
        let rejected = VersionStatus::Building
            .apply(Transition::Launch)
            .unwrap_err();
        let err = VersionError::rejected(&id, rejected);
        assert_eq!(err.code(), "invalid_transition");
        assert_eq!(err.to_string(), "version v1 cannot start (status: building)");
    }

    #[test]
    fn errors_map_to_http_statuses() {
        let id = VersionId("v1".to_string());
        assert_eq!(
            VersionError::NotFound(id.clone()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            VersionError::CapacityExceeded { max: 5 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            VersionError::BuildFailed("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            VersionError::NoPortsAvailable { base: 1, max: 2 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            VersionError::NotRunning(id).into_response().status(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn capacity_message_is_actionable() {
        let err = VersionError::CapacityExceeded { max: 5 };
        assert_eq!(
            err.to_string(),
            "maximum versions (5) reached, delete some first"
        );
    }
}
