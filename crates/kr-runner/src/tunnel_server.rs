//! Tunnel server, Runner side (§4.8): holds one long-lived WebSocket per
//! container (the container tunnel) and multiplexes any number of
//! user-originated forward chains over it by `client_id`.
//!
//! Mirrors the Host's `ws.rs` relay shape (split sender/receiver, spawn a
//! forwarding task) but adds the per-tunnel `client_id` table §5 calls for:
//! "one lock per tunnel" guarding monotonic, serialized allocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use kr_common::tunnel::{FrameType, TunnelHeader, TunnelProto};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

const TUNNEL_LOST_CLOSE_CODE: u16 = 1011;

/// One user-originated forward chain's outgoing half.
type UserSender = mpsc::UnboundedSender<Vec<u8>>;

/// State for a single container's tunnel: the channel that feeds frames
/// out to the container, and the table of user forwards multiplexed over
/// it.
struct ContainerTunnel {
    to_container: mpsc::UnboundedSender<Vec<u8>>,
    next_client_id: AtomicU32,
    /// Guards `next_client_id` allocation so it stays monotonic and
    /// serialized even under concurrent forward requests (§5 invariant a).
    alloc_lock: Mutex<()>,
    clients: RwLock<HashMap<u32, UserSender>>,
}

/// Registry of container tunnels, keyed by container id/name.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<ContainerTunnel>>>,
}

impl TunnelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn has(&self, container_id: &str) -> bool {
        self.tunnels.read().await.contains_key(container_id)
    }
}

pub fn router(registry: Arc<TunnelRegistry>) -> Router {
    Router::new()
        .route("/ws/tunnel/{container_id}", get(container_tunnel_handler))
        .route("/ws/forward/{container_name}/{port}", get(forward_handler))
        .with_state(registry)
}

async fn container_tunnel_handler(
    State(registry): State<Arc<TunnelRegistry>>,
    Path(container_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_container_tunnel(registry, container_id, socket))
}

async fn handle_container_tunnel(registry: Arc<TunnelRegistry>, container_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (to_container_tx, mut to_container_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let tunnel = Arc::new(ContainerTunnel {
        to_container: to_container_tx,
        next_client_id: AtomicU32::new(1),
        alloc_lock: Mutex::new(()),
        clients: RwLock::new(HashMap::new()),
    });
    registry.tunnels.write().await.insert(container_id.clone(), Arc::clone(&tunnel));
    info!(container_id, "container tunnel established");

    let outbound = tokio::spawn(async move {
        while let Some(bytes) = to_container_rx.recv().await {
            if sink.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Binary(bytes) = msg else { continue };
        let Ok(header) = TunnelHeader::decode(&bytes) else {
            warn!(container_id, "dropped malformed tunnel frame");
            continue;
        };
        let payload = bytes[kr_common::tunnel::HEADER_LEN..].to_vec();
        route_from_container(&tunnel, header, payload).await;
    }

    outbound.abort();
    registry.tunnels.write().await.remove(&container_id);
    // Container-tunnel disconnect closes every in-flight user WebSocket
    // with a "tunnel lost" code (§4.8 invariant c).
    let clients = tunnel.clients.write().await;
    for sender in clients.values() {
        let _ = sender.send(Vec::new()); // sentinel: empty frame signals close
    }
    info!(container_id, "container tunnel closed");
}

async fn route_from_container(tunnel: &ContainerTunnel, header: TunnelHeader, payload: Vec<u8>) {
    match header.frame_type {
        FrameType::Pong => {} // Runner -> container PING only; ignore stray pongs here.
        _ => {
            let clients = tunnel.clients.read().await;
            if let Some(sender) = clients.get(&header.client_id) {
                let mut framed = header.encode().to_vec();
                framed.extend(payload);
                let _ = sender.send(framed);
            }
        }
    }
}

async fn forward_handler(
    State(registry): State<Arc<TunnelRegistry>>,
    Path((container_name, port)): Path<(String, u16)>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !registry.has(&container_name).await {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    }
    ws.on_upgrade(move |socket| handle_forward(registry, container_name, port, socket))
        .into_response()
}

async fn handle_forward(registry: Arc<TunnelRegistry>, container_name: String, port: u16, socket: WebSocket) {
    let Some(tunnel) = registry.tunnels.read().await.get(&container_name).cloned() else {
        return;
    };

    let client_id = {
        let _guard = tunnel.alloc_lock.lock().await;
        tunnel.next_client_id.fetch_add(1, Ordering::SeqCst)
    };

    let (mut sink, mut stream) = socket.split();
    let (user_tx, mut user_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tunnel.clients.write().await.insert(client_id, user_tx);

    // Runner verifies the container tunnel exists (checked above) and
    // returns the text CONNECTED sentinel before any frame flows (§4.8
    // sequence).
    if sink.send(Message::Text("CONNECTED".into())).await.is_err() {
        tunnel.clients.write().await.remove(&client_id);
        return;
    }

    let connect = TunnelHeader {
        frame_type: FrameType::Connect,
        proto: TunnelProto::Tcp,
        client_id,
        port,
    };
    let _ = tunnel.to_container.send(connect.encode().to_vec());

    let outbound = tokio::spawn(async move {
        while let Some(frame) = user_rx.recv().await {
            if frame.is_empty() {
                let _ = sink
                    .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                        code: TUNNEL_LOST_CLOSE_CODE,
                        reason: "tunnel lost".into(),
                    })))
                    .await;
                break;
            }
            if sink.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        if let Message::Binary(bytes) = msg {
            let _ = tunnel.to_container.send(bytes.to_vec());
        }
    }

    outbound.abort();
    tunnel.clients.write().await.remove(&client_id);

    // On user-WebSocket disconnect the Runner synthesises CLOSE for the
    // client_id it owned (§4.8 invariant b).
    let close = TunnelHeader {
        frame_type: FrameType::Close,
        proto: TunnelProto::Tcp,
        client_id,
        port,
    };
    let _ = tunnel.to_container.send(close.encode().to_vec());
}
