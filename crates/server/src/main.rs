use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use server_api::{
    create_lobby, get_lobby, press_clock, start_lobby, ApiContext, LobbyBroadcaster,
};
use shared::{
    domain::{ClockId, LobbyId},
    error::{ApiError, ErrorCode},
    lobby::Lobby,
    protocol::{CreateLobbyRequest, LobbySnapshot, ServerEvent},
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url};

struct AppState {
    api: ApiContext,
    broadcaster: LobbyBroadcaster,
    heartbeat: Duration,
}

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .init();

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let broadcaster = LobbyBroadcaster::default();
    let api = ApiContext::new(Arc::new(storage), Arc::new(broadcaster.clone()))
        .with_limits(settings.request_limits());
    let state = AppState {
        api,
        broadcaster,
        heartbeat: settings.heartbeat_interval(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/lobbies", post(http_create_lobby))
        .route("/lobbies/:lobby_id", get(http_get_lobby))
        .route("/lobbies/:lobby_id/start", post(http_start_lobby))
        .route("/lobbies/:lobby_id/ws", get(ws_handler))
        .route("/clocks/:clock_id/press", post(http_press_clock))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn http_create_lobby(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLobbyRequest>,
) -> HttpResult<(StatusCode, Json<LobbySnapshot>)> {
    let lobby = create_lobby(&state.api, req).await.map_err(rejection)?;
    Ok((StatusCode::CREATED, snapshot(&state, &lobby)))
}

async fn http_get_lobby(
    State(state): State<Arc<AppState>>,
    Path(lobby_id): Path<String>,
) -> HttpResult<Json<LobbySnapshot>> {
    let lobby = get_lobby(&state.api, &LobbyId(lobby_id))
        .await
        .map_err(rejection)?;
    Ok(snapshot(&state, &lobby))
}

async fn http_start_lobby(
    State(state): State<Arc<AppState>>,
    Path(lobby_id): Path<String>,
) -> HttpResult<Json<LobbySnapshot>> {
    let lobby = start_lobby(&state.api, &LobbyId(lobby_id))
        .await
        .map_err(rejection)?;
    Ok(snapshot(&state, &lobby))
}

async fn http_press_clock(
    State(state): State<Arc<AppState>>,
    Path(clock_id): Path<String>,
) -> HttpResult<Json<LobbySnapshot>> {
    let lobby = press_clock(&state.api, &ClockId(clock_id))
        .await
        .map_err(rejection)?;
    Ok(snapshot(&state, &lobby))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(lobby_id): Path<String>,
) -> Response {
    let lobby_id = LobbyId(lobby_id);
    if let Err(err) = get_lobby(&state.api, &lobby_id).await {
        return rejection(err).into_response();
    }
    ws.on_upgrade(move |socket| ws_connection(state, socket, lobby_id))
}

/// Streams `ServerEvent`s for one lobby until either side goes away.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket, lobby_id: LobbyId) {
    let (mut sender, mut receiver) = socket.split();
    let mut subscription = state.broadcaster.register(&lobby_id);
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.tick().await;
    debug!(%lobby_id, "viewer connected");

    loop {
        let event = tokio::select! {
            received = subscription.recv() => match received {
                Ok(event) => event,
                // Missed updates collapse into one; the viewer refetches anyway.
                Err(RecvError::Lagged(_)) => ServerEvent::LobbyUpdated {
                    lobby_id: lobby_id.clone(),
                },
                Err(RecvError::Closed) => break,
            },
            _ = heartbeat.tick() => ServerEvent::Heartbeat,
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        };

        let text = match serde_json::to_string(&event) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if sender.send(Message::Text(text)).await.is_err() {
            break;
        }
    }

    state.broadcaster.unregister(subscription);
    debug!(%lobby_id, "viewer disconnected");
}

fn snapshot(state: &AppState, lobby: &Lobby) -> Json<LobbySnapshot> {
    Json(LobbySnapshot::at(lobby, (state.api.now)()))
}

fn rejection(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidTransition
        | ErrorCode::ClockNotActive
        | ErrorCode::LobbyPaused
        | ErrorCode::AlreadyRunning
        | ErrorCode::Conflict
        | ErrorCode::DuplicateId => StatusCode::CONFLICT,
        ErrorCode::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
