use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use brpc::{ClientId, net::normalize_bind_addr};

/// Lists the identities this process knows about: every registered client on
/// a server, the current session's own id on a client.
pub type ClientsSnapshot = Arc<dyn Fn() -> Vec<ClientId> + Send + Sync>;

#[derive(Clone)]
pub struct AdminState {
    pub role: &'static str,
    pub prometheus: PrometheusHandle,
    pub clients: ClientsSnapshot,
    pub config_path: PathBuf,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/clients", get(clients))
        .route("/config", get(config))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    addr: &str,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(normalize_bind_addr(addr).as_ref()).await?;
    tracing::info!(admin_addr = %listener.local_addr()?, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await?;

    tracing::info!("admin: stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prometheus.render(),
    )
}

#[derive(Debug, Serialize)]
struct ClientsResponse {
    role: &'static str,
    count: usize,
    clients: Vec<String>,
}

async fn clients(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let clients: Vec<String> = (st.clients)().iter().map(ToString::to_string).collect();
    (
        StatusCode::OK,
        Json(ClientsResponse {
            role: st.role,
            count: clients.len(),
            clients,
        }),
    )
}

#[derive(Debug, Serialize)]
struct ConfigResponse {
    path: String,
}

async fn config(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(ConfigResponse {
            path: st.config_path.display().to_string(),
        }),
    )
}
