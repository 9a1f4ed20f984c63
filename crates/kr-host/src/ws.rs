//! WebSocket relay: `/ws/task/{id}/terminal`, `/ws/forward/{task_id}/{port}`,
//! `/ws/fs/{task_id}/watch` (§4.8, §6).
//!
//! The Host is the middle hop of the three-hop chain CLI → Host → Runner.
//! Each route resolves the task's assigned Runner, opens an outbound
//! WebSocket to it, then relays frames in both directions until either side
//! closes — following the split-sender/receiver shape the pack's own
//! `ws_handler` uses (`nexa-sys-nexa-os/nvm/src/webgui/websocket.rs`).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::warn;

use crate::state::AppState;

/// Build the WebSocket routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/task/{id}/terminal", get(terminal))
        .route("/ws/forward/{task_id}/{port}", get(forward))
        .route("/ws/fs/{task_id}/watch", get(fs_watch))
}

fn runner_ws_url(reachable_url: &str, path: &str) -> String {
    let ws_base = reachable_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{ws_base}{path}")
}

async fn resolve_runner_url(
    state: &AppState,
    task_id: u64,
    runner_path: &str,
) -> Result<String, Response> {
    let task = state.tasks.get(task_id).await.map_err(|err| {
        crate::error::AppError::from(err).into_response()
    })?;
    let Some(hostname) = task.assigned_hostname else {
        return Err(crate::error::AppError::new(
            kr_common::ErrorKind::NotFound,
            "task has no assigned runner",
        )
        .into_response());
    };
    let node = state
        .registry
        .get(&hostname)
        .await
        .map_err(|err| crate::error::AppError::from(err).into_response())?;
    Ok(runner_ws_url(&node.reachable_url, runner_path))
}

/// Relay a client WebSocket to an upstream Runner WebSocket until either
/// side closes (§4.8 "cancellation: dropping either endpoint cancels the
/// chain").
async fn relay(client: WebSocket, runner_url: String) {
    let (runner_stream, _response) = match tokio_tungstenite::connect_async(&runner_url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(runner_url, error = %err, "failed to open runner tunnel websocket");
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut runner_tx, mut runner_rx) = runner_stream.split();

    let client_to_runner = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                Message::Binary(data) => TungsteniteMessage::Binary(data),
                Message::Text(text) => TungsteniteMessage::Text(text.to_string().into()),
                Message::Close(_) => break,
                Message::Ping(data) => TungsteniteMessage::Ping(data),
                Message::Pong(data) => TungsteniteMessage::Pong(data),
            };
            if runner_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    let runner_to_client = async {
        while let Some(Ok(msg)) = runner_rx.next().await {
            let forwarded = match msg {
                TungsteniteMessage::Binary(data) => Message::Binary(data),
                TungsteniteMessage::Text(text) => Message::Text(text.as_str().to_owned().into()),
                TungsteniteMessage::Close(_) => break,
                TungsteniteMessage::Ping(data) => Message::Ping(data),
                TungsteniteMessage::Pong(data) => Message::Pong(data),
                TungsteniteMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        () = client_to_runner => {}
        () = runner_to_client => {}
    }
}

async fn terminal(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    let runner_path = format!("/ws/terminal/{task_id}");
    match resolve_runner_url(&state, task_id, &runner_path).await {
        Ok(url) => ws.on_upgrade(move |socket| relay(socket, url)),
        Err(resp) => resp,
    }
}

async fn forward(
    State(state): State<Arc<AppState>>,
    Path((task_id, port)): Path<(u64, u16)>,
    ws: WebSocketUpgrade,
) -> Response {
    let runner_path = format!("/ws/forward/{task_id}/{port}");
    match resolve_runner_url(&state, task_id, &runner_path).await {
        Ok(url) => ws.on_upgrade(move |socket| relay(socket, url)),
        Err(resp) => resp,
    }
}

async fn fs_watch(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<u64>,
    ws: WebSocketUpgrade,
) -> Response {
    let runner_path = format!("/ws/fs/{task_id}/watch");
    match resolve_runner_url(&state, task_id, &runner_path).await {
        Ok(url) => ws.on_upgrade(move |socket| relay(socket, url)),
        Err(resp) => resp,
    }
}
