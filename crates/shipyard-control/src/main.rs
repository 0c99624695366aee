use std::sync::Arc;

use anyhow::Context;
use shipyard_control::{
    api::{self, AppState},
    config::ControlConfig,
    manager::VersionManager,
    router::TrafficRouter,
    telemetry,
    vcs::{GitVcs, Vcs},
};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = telemetry::init();

    let config = ControlConfig::from_env()?;
    let vcs: Option<Arc<dyn Vcs>> = match &config.repo_dir {
        Some(dir) => Some(Arc::new(GitVcs::new(dir))),
        None => {
            tracing::warn!("SHIPYARD_REPO_DIR not set; branch management and builds are disabled");
            None
        }
    };

    let manager = Arc::new(
        VersionManager::open(config.clone(), vcs)
            .await
            .context("open version registry")?,
    );
    tracing::info!(
        data_dir = %config.data_dir.display(),
        versions = manager.list_versions().await.len(),
        ports = ?config.port_range(),
        "version registry loaded"
    );

    let router = Arc::new(TrafficRouter::new(
        manager.registry().clone(),
        config.main_domain.clone(),
    )?);
    let _invalidation = router.spawn_invalidation();

    let app = api::app(AppState {
        manager: manager.clone(),
        router,
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, domain = %config.main_domain, "shipyard-control HTTP listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}
