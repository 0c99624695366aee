//! Subdomain router: `<id>.<main domain>` is forwarded to that version's
//! local port, everything else falls through to the management app.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    extract::{
        FromRequestParts, Request, State,
        ws::{CloseFrame as ClientCloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use shipyard_version::{AgentVersion, VersionId, VersionStatus};
use tokio::sync::{RwLock, broadcast};
use tokio_tungstenite::tungstenite::{
    Message as BackendMessage,
    client::IntoClientRequest,
    protocol::{CloseFrame as BackendCloseFrame, frame::coding::CloseCode},
};
use tracing::{debug, warn};

use crate::{error::json_error, registry::Registry};

/// Loopback address backends are reached on. An IPv4 literal avoids
/// `localhost` resolving to `::1` while the version listens on IPv4 only.
const BACKEND_HOST: &str = "127.0.0.1";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Cached handle for forwarding to one running version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub port: u16,
    http_base: String,
    ws_base: String,
}

impl ProxyTarget {
    fn new(port: u16) -> Self {
        Self {
            port,
            http_base: format!("http://{BACKEND_HOST}:{port}"),
            ws_base: format!("ws://{BACKEND_HOST}:{port}"),
        }
    }

    fn authority(&self) -> String {
        format!("{BACKEND_HOST}:{}", self.port)
    }
}

/// Extracts the version label from `host`.
///
/// `None` means "not a version request": a foreign host, the bare main
/// domain, or `www`.
pub fn version_label(host: &str, main_domain: &str) -> Option<String> {
    let host = host.trim().trim_end_matches('.');
    if host.starts_with('[') {
        return None;
    }
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    let host = host.to_ascii_lowercase();
    let main = main_domain.trim_matches('.').to_ascii_lowercase();

    let label = host.strip_suffix(&main)?.strip_suffix('.')?;
    if label.is_empty() || label == "www" {
        return None;
    }
    Some(label.to_string())
}

fn request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let has_token = |name: HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    has_token(header::CONNECTION, "upgrade") && has_token(header::UPGRADE, "websocket")
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

pub struct TrafficRouter {
    registry: Arc<Registry>,
    main_domain: String,
    client: reqwest::Client,
    targets: RwLock<HashMap<VersionId, ProxyTarget>>,
}

impl TrafficRouter {
    pub fn new(registry: Arc<Registry>, main_domain: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            registry,
            main_domain: main_domain.into(),
            client,
            targets: RwLock::new(HashMap::new()),
        })
    }

    /// Drops cached targets for versions that stopped serving.
    pub fn spawn_invalidation(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let mut rx = self.registry.subscribe_stopped();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(id) => router.invalidate(&id).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "router fell behind on stop events; clearing cache");
                        router.targets.write().await.clear();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn invalidate(&self, id: &VersionId) {
        if self.targets.write().await.remove(id).is_some() {
            debug!(%id, "proxy target invalidated");
        }
    }

    pub async fn cached_targets(&self) -> usize {
        self.targets.read().await.len()
    }

    fn routable(v: &AgentVersion) -> bool {
        v.status == VersionStatus::Running && v.port != 0
    }

    /// The forwarding target for `id`, if it is running.
    pub async fn resolve_target(&self, id: &VersionId) -> Option<ProxyTarget> {
        let v = self.registry.get(id).await?;
        self.target_for(&v).await
    }

    async fn target_for(&self, v: &AgentVersion) -> Option<ProxyTarget> {
        if !Self::routable(v) {
            return None;
        }
        if let Some(t) = self.targets.read().await.get(&v.id)
            && t.port == v.port
        {
            debug!(id = %v.id, port = t.port, "proxy cache hit");
            return Some(t.clone());
        }
        debug!(id = %v.id, port = v.port, "proxy cache miss");
        let target = ProxyTarget::new(v.port);
        self.targets
            .write()
            .await
            .insert(v.id.clone(), target.clone());
        Some(target)
    }

    /// Handles version requests; hands anything else back to the caller.
    pub async fn route(&self, req: Request) -> Result<Response, Request> {
        let Some(host) = request_host(&req) else {
            return Err(req);
        };
        let Some(label) = version_label(&host, &self.main_domain) else {
            return Err(req);
        };

        let Some(v) = (match VersionId::parse(&label) {
            Some(id) => self.registry.get(&id).await,
            None => None,
        }) else {
            return Ok(json_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("version {label} not found"),
            ));
        };
        let Some(target) = self.target_for(&v).await else {
            return Ok(json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "not_running",
                format!("version {} is not running (status: {})", v.id, v.status),
            ));
        };

        if is_upgrade_request(req.headers()) {
            Ok(self.bridge_websocket(req, &v.id, target).await)
        } else {
            Ok(self.forward(req, &host, &v.id, target).await)
        }
    }

    async fn forward(&self, req: Request, host: &str, id: &VersionId, target: ProxyTarget) -> Response {
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", target.http_base, path);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        if let Ok(v) = HeaderValue::from_str(&target.authority()) {
            headers.insert(header::HOST, v);
        }
        if let Ok(v) = HeaderValue::from_str(host) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), v);
        }

        let upstream = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await;

        let resp = match upstream {
            Ok(resp) => resp,
            Err(err) => {
                warn!(%id, port = target.port, error = %err, "backend request failed");
                return json_error(
                    StatusCode::BAD_GATEWAY,
                    "bad_gateway",
                    format!("version {id} did not answer on port {}", target.port),
                );
            }
        };

        let status = resp.status();
        let mut headers = resp.headers().clone();
        strip_hop_by_hop(&mut headers);
        let mut out = Response::new(Body::from_stream(resp.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        out
    }

    async fn bridge_websocket(&self, req: Request, id: &VersionId, target: ProxyTarget) -> Response {
        let (mut parts, _body) = req.into_parts();
        let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws,
            Err(rejection) => return rejection.into_response(),
        };

        let path = parts
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", target.ws_base, path);
        let protocol = parts.headers.get(header::SEC_WEBSOCKET_PROTOCOL).cloned();
        let id = id.clone();

        ws.on_upgrade(move |client| async move {
            relay(client, url, protocol, id).await;
        })
    }
}

/// Axum middleware: version hosts are proxied, the rest reaches `next`.
pub async fn dispatch(State(router): State<Arc<TrafficRouter>>, req: Request, next: Next) -> Response {
    match router.route(req).await {
        Ok(resp) => resp,
        Err(req) => next.run(req).await,
    }
}

fn to_backend(msg: ClientMessage) -> BackendMessage {
    match msg {
        ClientMessage::Text(t) => BackendMessage::Text(t.into()),
        ClientMessage::Binary(b) => BackendMessage::Binary(b.into()),
        ClientMessage::Ping(b) => BackendMessage::Ping(b.into()),
        ClientMessage::Pong(b) => BackendMessage::Pong(b.into()),
        ClientMessage::Close(frame) => BackendMessage::Close(frame.map(|f| BackendCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason.into_owned().into(),
        })),
    }
}

fn to_client(msg: BackendMessage) -> Option<ClientMessage> {
    Some(match msg {
        BackendMessage::Text(t) => ClientMessage::Text(t.as_str().to_owned()),
        BackendMessage::Binary(b) => ClientMessage::Binary(b.to_vec()),
        BackendMessage::Ping(b) => ClientMessage::Ping(b.to_vec()),
        BackendMessage::Pong(b) => ClientMessage::Pong(b.to_vec()),
        BackendMessage::Close(frame) => ClientMessage::Close(frame.map(|f| ClientCloseFrame {
            code: u16::from(f.code),
            reason: Cow::Owned(f.reason.as_str().to_owned()),
        })),
        BackendMessage::Frame(_) => return None,
    })
}

/// Pumps frames both ways until either side closes, then tears down both.
async fn relay(mut client: WebSocket, url: String, protocol: Option<HeaderValue>, id: VersionId) {
    let request = match url.as_str().into_client_request() {
        Ok(mut r) => {
            if let Some(p) = protocol {
                r.headers_mut().insert(header::SEC_WEBSOCKET_PROTOCOL, p);
            }
            r
        }
        Err(err) => {
            warn!(%id, error = %err, "invalid backend websocket url");
            return;
        }
    };

    let backend = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            warn!(%id, %url, error = %err, "backend websocket connect failed");
            let _ = client
                .send(ClientMessage::Close(Some(ClientCloseFrame {
                    code: 1011,
                    reason: Cow::Borrowed("version unavailable"),
                })))
                .await;
            return;
        }
    };
    debug!(%id, %url, "websocket bridge open");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    let mut upstream = tokio::spawn(async move {
        while let Some(Ok(msg)) = client_rx.next().await {
            let closing = matches!(msg, ClientMessage::Close(_));
            if backend_tx.send(to_backend(msg)).await.is_err() || closing {
                break;
            }
        }
        let _ = backend_tx.close().await;
    });

    let mut downstream = tokio::spawn(async move {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let closing = matches!(msg, BackendMessage::Close(_));
            let Some(msg) = to_client(msg) else {
                continue;
            };
            if client_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    });

    tokio::select! {
        _ = &mut upstream => downstream.abort(),
        _ = &mut downstream => upstream.abort(),
    }
    debug!(%id, "websocket bridge closed");
}
