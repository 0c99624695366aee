use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use shipyard_version::{AgentVersion, VersionId, VersionStatus};
use tracing::Instrument;

use crate::{
    error::{VersionError, json_error},
    manager::VersionManager,
    router::{self, TrafficRouter},
};

const DEFAULT_LOG_LINES: usize = 50;
const MAX_LOG_LINES: usize = 10_000;

const X_REQUEST_ID: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<VersionManager>,
    pub router: Arc<TrafficRouter>,
}

/// Management routes behind the version router.
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/versions", get(list_versions).post(create_version))
        .route("/versions/:id", get(get_version).delete(delete_version))
        .route("/versions/:id/build", post(build_version))
        .route("/versions/:id/rebuild", post(rebuild_version))
        .route("/versions/:id/start", post(start_version))
        .route("/versions/:id/stop", post(stop_version))
        .route("/versions/:id/restart", post(restart_version))
        .route("/versions/:id/logs", get(version_logs))
        .route("/versions/:id/health", get(version_health))
        .route("/versions/:id/changes", post(apply_changes));

    Router::new()
        .route("/", get(index))
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(
            state.router.clone(),
            router::dispatch,
        ))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Tags each request with an id (client-supplied or generated) for logs.
async fn request_id(req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(|v| v.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut resp = next.run(req).instrument(span).await;
    if let Ok(v) = HeaderValue::from_str(&id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(X_REQUEST_ID), v);
    }
    resp
}

fn parse_id(raw: &str) -> Result<VersionId, VersionError> {
    VersionId::parse(raw).ok_or_else(|| VersionError::InvalidInput(format!("invalid version id {raw:?}")))
}

fn plain_text(body: String) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    versions: usize,
    running: usize,
    max_versions: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let versions = state.manager.list_versions().await;
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        versions: versions.len(),
        running: versions
            .iter()
            .filter(|v| v.status == VersionStatus::Running)
            .count(),
        max_versions: state.manager.config().max_versions,
    })
}

async fn index(State(state): State<AppState>) -> Response {
    plain_text(state.manager.status_text().await)
}

async fn not_found(uri: Uri) -> Response {
    json_error(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {}", uri.path()),
    )
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    format: Option<String>,
}

async fn list_versions(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    match q.format.as_deref() {
        Some("text") => plain_text(state.manager.status_text().await),
        Some("summary") => Json(state.manager.list_summaries().await).into_response(),
        _ => Json(state.manager.list_versions().await).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateVersionRequest {
    name: String,
    #[serde(default)]
    description: String,
}

async fn create_version(
    State(state): State<AppState>,
    Json(req): Json<CreateVersionRequest>,
) -> Result<(StatusCode, Json<AgentVersion>), VersionError> {
    let v = state
        .manager
        .create_version(&req.name, &req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(v)))
}

async fn get_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.get_version(&parse_id(&id)?).await?))
}

async fn delete_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.delete_version(&parse_id(&id)?).await?))
}

async fn build_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.build_version(&parse_id(&id)?).await?))
}

async fn rebuild_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.rebuild_version(&parse_id(&id)?).await?))
}

async fn start_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.start_version(&parse_id(&id)?).await?))
}

async fn stop_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.stop_version(&parse_id(&id)?).await?))
}

async fn restart_version(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentVersion>, VersionError> {
    Ok(Json(state.manager.restart_version(&parse_id(&id)?).await?))
}

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

async fn version_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<Response, VersionError> {
    let lines = q.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let text = state.manager.version_logs(&parse_id(&id)?, lines).await?;
    Ok(plain_text(text))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    id: VersionId,
    healthy: bool,
    status: VersionStatus,
}

async fn version_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HealthResponse>, VersionError> {
    let id = parse_id(&id)?;
    let healthy = state.manager.check_health(&id).await?;
    let v = state.manager.get_version(&id).await?;
    Ok(Json(HealthResponse {
        id,
        healthy,
        status: v.status,
    }))
}

#[derive(Debug, Deserialize)]
struct ApplyChangesRequest {
    path: String,
    content: String,
}

async fn apply_changes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ApplyChangesRequest>,
) -> Result<Json<AgentVersion>, VersionError> {
    let v = state
        .manager
        .apply_changes(&parse_id(&id)?, &req.path, &req.content)
        .await?;
    Ok(Json(v))
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        error::ErrorBody,
        test_support::{FakeVcs, test_config},
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        base: String,
        client: reqwest::Client,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let mut config = test_config(&dir.path().join("versions"));
        config.main_domain = "example.com".to_string();

        let manager = Arc::new(
            VersionManager::open(config, Some(Arc::new(FakeVcs::new(tree))))
                .await
                .unwrap(),
        );
        let router = Arc::new(TrafficRouter::new(manager.registry().clone(), "example.com").unwrap());
        let app = app(AppState { manager, router });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Fixture {
            _dir: dir,
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::builder().no_proxy().build().unwrap(),
        }
    }

    impl Fixture {
        async fn create(&self, name: &str) -> AgentVersion {
            let resp = self
                .client
                .post(format!("{}/api/versions", self.base))
                .json(&json!({ "name": name, "description": "from test" }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::CREATED);
            resp.json().await.unwrap()
        }
    }

    #[tokio::test]
    async fn healthz_reports_counts() {
        let fx = fixture().await;
        fx.create("one").await;
        let body: Value = fx
            .client
            .get(format!("{}/healthz", fx.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["versions"], 1);
        assert_eq!(body["running"], 0);
        assert_eq!(body["max_versions"], 5);
    }

    #[tokio::test]
    async fn version_lifecycle_over_http() {
        let fx = fixture().await;
        let v = fx.create("http flow").await;
        assert_eq!(v.status, VersionStatus::Pending);

        let err: ErrorBody = fx
            .client
            .post(format!("{}/api/versions/{}/start", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(err.code, "invalid_transition");

        let built: AgentVersion = fx
            .client
            .post(format!("{}/api/versions/{}/build", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(built.status, VersionStatus::Ready);

        let started: AgentVersion = fx
            .client
            .post(format!("{}/api/versions/{}/start", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(started.status, VersionStatus::Running);

        let health: Value = fx
            .client
            .get(format!("{}/api/versions/{}/health", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);
        assert_eq!(health["status"], "running");

        let logs = fx
            .client
            .get(format!("{}/api/versions/{}/logs?lines=5", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(logs.contains("[shipyard]"));

        let resp = fx
            .client
            .delete(format!("{}/api/versions/{}", fx.base, v.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = fx
            .client
            .get(format!("{}/api/versions/{}", fx.base, v.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let err: ErrorBody = resp.json().await.unwrap();
        assert_eq!(err.code, "not_found");
    }

    #[tokio::test]
    async fn capacity_is_reported_as_conflict() {
        let fx = fixture().await;
        for i in 0..5 {
            fx.create(&format!("v{i}")).await;
        }
        let resp = fx
            .client
            .post(format!("{}/api/versions", fx.base))
            .json(&json!({ "name": "sixth" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let err: ErrorBody = resp.json().await.unwrap();
        assert_eq!(err.code, "capacity_exceeded");

        let text = fx
            .client
            .get(format!("{}/api/versions?format=text", fx.base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(text.lines().count(), 5);
    }

    #[tokio::test]
    async fn changes_and_logs_defaults() {
        let fx = fixture().await;
        let v = fx.create("edits").await;

        let resp = fx
            .client
            .post(format!("{}/api/versions/{}/changes", fx.base, v.id))
            .json(&json!({ "path": "README.md", "content": "hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = fx
            .client
            .post(format!("{}/api/versions/{}/changes", fx.base, v.id))
            .json(&json!({ "path": "/etc/passwd", "content": "x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let logs = fx
            .client
            .get(format!("{}/api/versions/{}/logs", fx.base, v.id))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(logs, crate::logs::NO_LOGS);
    }

    #[tokio::test]
    async fn version_hosts_are_routed_before_the_api() {
        let fx = fixture().await;
        let v = fx.create("routed").await;

        let resp = fx
            .client
            .get(format!("{}/api/versions", fx.base))
            .header(header::HOST, format!("{}.example.com", v.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let err: ErrorBody = resp.json().await.unwrap();
        assert_eq!(err.code, "not_running");

        let resp = fx
            .client
            .get(format!("{}/healthz", fx.base))
            .header(header::HOST, "www.example.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_ids_are_echoed_or_generated() {
        let fx = fixture().await;
        let resp = fx
            .client
            .get(format!("{}/healthz", fx.base))
            .header("x-request-id", "abc-123")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-request-id"], "abc-123");

        let resp = fx
            .client
            .get(format!("{}/nowhere", fx.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(!resp.headers()["x-request-id"].is_empty());
    }
}
