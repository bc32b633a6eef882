use crate::bridge::AppLifecycle;
use crate::core::PlaybackCoordinator;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use nowplaying_proto::state::PlaybackSnapshot;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    coordinator: PlaybackCoordinator,
    lifecycle_tx: mpsc::Sender<AppLifecycle>,
}

fn router(coordinator: PlaybackCoordinator, lifecycle_tx: mpsc::Sender<AppLifecycle>) -> Router {
    let app_state = HttpState {
        coordinator,
        lifecycle_tx,
    };
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/play", get(play).post(play))
        .route("/api/stop", get(stop).post(stop))
        .route("/api/toggle", get(toggle).post(toggle))
        .route("/api/foreground", post(foreground))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    coordinator: PlaybackCoordinator,
    lifecycle_tx: mpsc::Sender<AppLifecycle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(coordinator, lifecycle_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<PlaybackSnapshot> {
    Json(state.coordinator.snapshot())
}

// Commands complete before answering, so the body is the resulting snapshot.

async fn play(State(state): State<HttpState>) -> Json<PlaybackSnapshot> {
    info!("HTTP API: Play");
    state.coordinator.play().await;
    Json(state.coordinator.snapshot())
}

async fn stop(State(state): State<HttpState>) -> Json<PlaybackSnapshot> {
    info!("HTTP API: Stop");
    state.coordinator.stop().await;
    Json(state.coordinator.snapshot())
}

async fn toggle(State(state): State<HttpState>) -> Json<PlaybackSnapshot> {
    info!("HTTP API: Toggle");
    state.coordinator.toggle().await;
    Json(state.coordinator.snapshot())
}

async fn foreground(State(state): State<HttpState>) -> StatusCode {
    if state.lifecycle_tx.send(AppLifecycle::Foreground).await.is_err() {
        error!("Failed to forward foreground event");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}
