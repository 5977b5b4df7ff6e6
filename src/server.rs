use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::{self, AppState};
use crate::config::ShipyardConfig;
use crate::project::FileProjectStore;

/// Build the application router around assembled state.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Serve the polling API until Ctrl+C, then stop the sweeper and every
/// sandbox runtime still running.
pub async fn start_server(config: ShipyardConfig) -> Result<()> {
    std::fs::create_dir_all(&config.paths.store_dir).with_context(|| {
        format!(
            "Failed to create project store directory {}",
            config.paths.store_dir.display()
        )
    })?;
    let store = Arc::new(FileProjectStore::new(config.paths.store_dir.clone()));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let dev_mode = config.server.dev_mode;

    let state = Arc::new(AppState::assemble(config, store).await);
    let sweeper = state.sweeper().spawn();
    let app = build_router(Arc::clone(&state), dev_mode);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(
        address = %local_addr,
        runtime = ?state.runtime.kind(),
        "shipyard listening"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    sweeper.abort();
    state.runtime.shutdown().await;
    info!("server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C, shutting down");
        return;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeMode;
    use crate::project::MemoryProjectStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn test_router(dev_mode: bool) -> Router {
        let mut config = ShipyardConfig::default();
        config.runtime.mode = RuntimeMode::Local;
        let state = AppState::assemble(config, Arc::new(MemoryProjectStore::new())).await;
        build_router(Arc::new(state), dev_mode)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let resp = test_router(false)
            .await
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_dev_mode_enables_cors() {
        let req = Request::builder()
            .uri("/health")
            .header("origin", "http://localhost:5173")
            .body(Body::empty())
            .unwrap();
        let resp = test_router(true).await.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("access-control-allow-origin").is_some());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let resp = test_router(false)
            .await
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
