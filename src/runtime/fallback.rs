//! In-process stand-in for a side without a runnable entry point.
//!
//! Answers `/health` and `/api/health` with JSON and serves the side's
//! static `index.html` (plus sibling assets) when one exists, so health
//! probes always have something to talk to.

use std::path::{Path, PathBuf};

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

use super::Side;
use crate::errors::RuntimeError;

/// Directory holding the side's `index.html`, if any.
pub fn static_root(dir: &Path) -> Option<PathBuf> {
    ["dist", "build", "public", ""]
        .iter()
        .map(|sub| if sub.is_empty() { dir.to_path_buf() } else { dir.join(sub) })
        .find(|candidate| candidate.join("index.html").is_file())
}

fn router(side: Side, static_dir: Option<PathBuf>) -> Router {
    let health = move || async move {
        Json(json!({
            "status": "ok",
            "side": side.as_str(),
            "fallback": true,
        }))
    };
    let app = Router::new()
        .route("/health", get(health.clone()))
        .route("/api/health", get(health));

    match static_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true)),
        None => app.route(
            "/",
            get(move || async move {
                format!("shipyard sandbox {} placeholder: no runnable entry point found\n", side)
            }),
        ),
    }
}

/// Bind `127.0.0.1:port` and serve in a background task.
pub async fn spawn_responder(
    side: Side,
    dir: &Path,
    port: u16,
) -> Result<JoinHandle<()>, RuntimeError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                RuntimeError::PortInUse(port)
            } else {
                RuntimeError::Io(e)
            }
        })?;

    let static_dir = static_root(dir);
    debug!(%side, port, static_dir = ?static_dir, "fallback responder listening");
    let app = router(side, static_dir);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(%side, port, error = %e, "fallback responder stopped");
        }
    }))
}
