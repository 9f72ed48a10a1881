use crate::core::DaemonEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use commons_proto::icy::IcyProbe;
use commons_proto::protocol::{Command, DaemonState};
use commons_proto::state::StateManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<DaemonEvent>,
    pub probe: Arc<IcyProbe>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

#[derive(Deserialize)]
struct NowPlayingQuery {
    url: Option<String>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/now-playing", get(now_playing))
        .route("/api/state", get(get_state))
        .route("/api/play/:idx", get(play_station).post(play_station))
        .route(
            "/api/play/:idx/:channel",
            get(play_channel).post(play_channel),
        )
        .route("/api/pause", get(pause).post(pause))
        .route("/api/resume", get(resume).post(resume))
        .route("/api/close", get(close).post(close))
        .route("/api/next", get(next_station).post(next_station))
        .route("/api/prev", get(prev_station).post(prev_station))
        .route("/api/random", get(random_station).post(random_station))
        .route("/api/volume/:percent", get(set_volume).post(set_volume))
        .route("/api/volume", get(get_volume))
        .route("/api/favorite/:station_id", post(toggle_favorite))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

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

/// Probe a stream's in-band metadata on behalf of a browser client.
async fn now_playing(
    State(state): State<HttpState>,
    Query(query): Query<NowPlayingQuery>,
) -> Response {
    let Some(url) = query.url.filter(|u| !u.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "Missing url parameter" })),
        )
            .into_response();
    };
    Json(state.probe.probe(&url).await).into_response()
}

async fn get_state(State(state): State<HttpState>) -> Json<DaemonState> {
    Json(state.state_manager.get_state().await)
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state
        .event_tx
        .send(DaemonEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command, event loop is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn play_station(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    forward(
        &state,
        Command::Play {
            station_idx: idx,
            channel: None,
        },
    )
    .await
}

async fn play_channel(
    State(state): State<HttpState>,
    Path((idx, channel)): Path<(usize, String)>,
) -> StatusCode {
    forward(
        &state,
        Command::Play {
            station_idx: idx,
            channel: Some(channel),
        },
    )
    .await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Pause).await
}

async fn resume(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Resume).await
}

async fn close(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Close).await
}

async fn next_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Next).await
}

async fn prev_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Prev).await
}

async fn random_station(State(state): State<HttpState>) -> StatusCode {
    forward(&state, Command::Random).await
}

async fn set_volume(State(state): State<HttpState>, Path(percent): Path<i32>) -> StatusCode {
    let value = (percent as f32 / 100.0).clamp(0.0, 1.0);
    forward(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let daemon_state = state.state_manager.get_state().await;
    let volume = (daemon_state.volume * 100.0).round() as u8;
    Json(VolumeStatus { volume })
}

async fn toggle_favorite(
    State(state): State<HttpState>,
    Path(station_id): Path<String>,
) -> StatusCode {
    forward(&state, Command::ToggleFavorite { station_id }).await
}
