//! HTTP boundary for the session controller. Renders nothing itself: it
//! forwards input events into the session and hands the latest snapshot to
//! whatever front-end is served from `static/`.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

use crate::engine::Participant;
use crate::game::GameError;
use crate::session::{SessionConfig, SessionHandle, Snapshot};

/// How long a commit waits for the session to publish before answering with
/// whatever snapshot is current
const RESPONSE_WAIT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    session: Arc<Mutex<SessionHandle>>,
}

impl AppState {
    /// Start with a default session so `/api/state` always has something to
    /// say
    pub fn new() -> Result<Self, GameError> {
        let handle = SessionHandle::spawn(SessionConfig::default())?;
        Ok(AppState {
            session: Arc::new(Mutex::new(handle)),
        })
    }
}

#[derive(Deserialize)]
pub struct NewGameRequest {
    nrows: usize,
    ncols: usize,
    first_mover: String,
}

#[derive(Deserialize)]
pub struct CellInputRequest {
    row: usize,
    col: usize,
    text: String,
}

fn string_to_participant(s: &str) -> Participant {
    match s.to_lowercase().as_str() {
        "agent" => Participant::Agent,
        _ => Participant::Human,
    }
}

#[axum::debug_handler]
async fn new_game(State(state): State<AppState>, Json(req): Json<NewGameRequest>) -> Response {
    let config = SessionConfig {
        nrows: req.nrows,
        ncols: req.ncols,
        first_mover: string_to_participant(&req.first_mover),
        ..SessionConfig::default()
    };

    match SessionHandle::spawn(config) {
        Ok(mut handle) => {
            // wait for the first rebuild so the response shows the real grid
            let snapshot = wait_for_snapshot(&mut handle).await;
            // replacing the handle tears the previous session down and
            // disposes its engine
            *state.session.lock().await = handle;
            info!(req.nrows, req.ncols, "new session started");
            Json(snapshot).into_response()
        }
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[axum::debug_handler]
async fn cell_change(
    State(state): State<AppState>,
    Json(req): Json<CellInputRequest>,
) -> Json<Snapshot> {
    let mut handle = state.session.lock().await;
    handle.cell_change(req.row, req.col, req.text);
    Json(wait_for_snapshot(&mut handle).await)
}

#[axum::debug_handler]
async fn cell_blur(
    State(state): State<AppState>,
    Json(req): Json<CellInputRequest>,
) -> Json<Snapshot> {
    let mut handle = state.session.lock().await;
    handle.cell_blur(req.row, req.col, req.text);
    Json(wait_for_snapshot(&mut handle).await)
}

#[axum::debug_handler]
async fn get_state(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.session.lock().await.snapshot())
}

async fn wait_for_snapshot(handle: &mut SessionHandle) -> Snapshot {
    match tokio::time::timeout(RESPONSE_WAIT, handle.changed()).await {
        Ok(snapshot) => snapshot,
        Err(_) => handle.snapshot(),
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/new-game", post(new_game))
        .route("/api/cell-change", post(cell_change))
        .route("/api/cell-blur", post(cell_blur))
        .route("/api/state", get(get_state))
        .nest_service("/", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let state = AppState::new()?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    info!("web server running at http://127.0.0.1:3000");

    axum::serve(listener, app).await?;
    Ok(())
}
