//! Operator status surface.
//!
//! - `GET /api/status`: pool statistics and the last batch report as JSON
//! - `GET /metrics`: the same numbers in Prometheus text format

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};

use crate::AgentState;

pub fn router(state: Arc<AgentState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/metrics", get(metrics))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(state: Arc<AgentState>, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!(%addr, "status server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index() -> axum::response::Html<&'static str> {
    axum::response::Html(
        r#"<!DOCTYPE html>
<html><head><title>Farm Agent</title></head>
<body>
<h1>Device Farm Agent</h1>
<p><a href="/api/status">Status JSON</a> · <a href="/metrics">Metrics</a></p>
</body></html>"#,
    )
}

async fn status(State(state): State<Arc<AgentState>>) -> Json<serde_json::Value> {
    let pool = state.pool.snapshot();
    let last_batch = state.last_batch.read().await.clone();

    Json(serde_json::json!({
        "simulate": state.simulate,
        "uptime_s": state.started_at.elapsed().as_secs(),
        "pool": pool,
        "last_batch": last_batch,
    }))
}

async fn metrics(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    let pool = state.pool.snapshot();
    let last_batch = state.last_batch.read().await;
    let body = farm_core::metrics::render_prometheus(&pool, last_batch.as_ref());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use farm_core::{FarmConfig, Orchestrator, SimulatedConnector};

    async fn state_with_batch() -> Arc<AgentState> {
        let config = FarmConfig::default();
        let sim = Arc::new(SimulatedConnector::fleet("sim", 3, std::time::Duration::ZERO));
        let ids = sim.device_ids();
        let state = AgentState::new(&config, sim, true);
        let report = state.orchestrator.connect_devices(ids).await;
        *state.last_batch.write().await = Some(report);
        state
    }

    async fn get_body(app: Router, uri: &str) -> (axum::http::StatusCode, String) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn status_json_reports_pool_and_batch() {
        let state = state_with_batch().await;
        let (code, body) = get_body(router(state), "/api/status").await;
        assert_eq!(code, axum::http::StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["simulate"], true);
        assert_eq!(json["pool"]["active"], 3);
        assert_eq!(json["pool"]["active_identifiers"][0], "sim-0");
        assert_eq!(json["last_batch"]["successful"], 3);
        assert_eq!(json["last_batch"]["profile"]["tier_label"], "Ultra");
    }

    #[tokio::test]
    async fn metrics_text() {
        let state = state_with_batch().await;
        let (code, body) = get_body(router(state), "/metrics").await;
        assert_eq!(code, axum::http::StatusCode::OK);
        assert!(body.contains("farm_pool_sessions_active 3"));
        assert!(body.contains("outcome=\"successful\"} 3"));
    }

    #[tokio::test]
    async fn status_before_any_batch() {
        let sim = Arc::new(SimulatedConnector::new());
        let state = AgentState::new(&FarmConfig::default(), sim, false);
        let (_, body) = get_body(router(state), "/api/status").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(json["last_batch"].is_null());
        assert_eq!(json["pool"]["total"], 0);
    }
}
