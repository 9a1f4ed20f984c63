//! SSH proxy (§4.9): a TCP listener that hands a bare socket off to a
//! Runner's SSH port after a one-line text handshake.

use std::sync::Arc;

use kr_common::model::{NodeStatus, TaskKind, TaskStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::state::AppState;

const REQUEST_PREFIX: &str = "REQUEST_TUNNEL ";

/// Run the SSH proxy listener until the process exits.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot bind.
pub async fn run(state: Arc<AppState>) -> std::io::Result<()> {
    let listener = TcpListener::bind(state.config.ssh_proxy_addr).await?;
    info!(addr = %state.config.ssh_proxy_addr, "ssh proxy listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(state, socket).await {
                warn!(%peer, error = %err, "ssh proxy connection failed");
            }
        });
    }
}

async fn handle_connection(state: Arc<AppState>, mut client: TcpStream) -> std::io::Result<()> {
    let mut line = String::new();
    {
        let mut reader = BufReader::new(&mut client);
        reader.read_line(&mut line).await?;
    }
    let line = line.trim_end();

    let Some(task_id_raw) = line.strip_prefix(REQUEST_PREFIX) else {
        client.write_all(b"ERROR malformed request\n").await?;
        return Ok(());
    };

    let Ok(task_id) = task_id_raw.parse::<u64>() else {
        client.write_all(b"ERROR bad task id\n").await?;
        return Ok(());
    };

    match resolve_ssh_target(&state, task_id).await {
        Ok((hostname, ssh_port)) => splice_to_runner(client, &state, &hostname, ssh_port).await,
        Err(reason) => {
            let msg = format!("ERROR {reason}\n");
            client.write_all(msg.as_bytes()).await?;
            Ok(())
        }
    }
}

async fn resolve_ssh_target(state: &AppState, task_id: u64) -> Result<(String, u16), &'static str> {
    let task = state.tasks.get(task_id).await.map_err(|_| "task not found")?;
    if task.kind != TaskKind::Vps {
        return Err("task is not a vps");
    }
    if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
        return Err("task is not running or paused");
    }
    let hostname = task.assigned_hostname.ok_or("task has no assigned runner")?;
    let node = state
        .registry
        .get(&hostname)
        .await
        .map_err(|_| "assigned runner not found")?;
    if node.status != NodeStatus::Online {
        return Err("assigned runner is offline");
    }
    let ssh_port = task
        .vps
        .as_ref()
        .and_then(|v| v.ssh_port)
        .ok_or("no recorded ssh port")?;
    Ok((hostname, ssh_port))
}

async fn splice_to_runner(
    mut client: TcpStream,
    state: &AppState,
    hostname: &str,
    ssh_port: u16,
) -> std::io::Result<()> {
    let node = match state.registry.get(hostname).await {
        Ok(n) => n,
        Err(_) => {
            client.write_all(b"ERROR assigned runner not found\n").await?;
            return Ok(());
        }
    };
    let runner_host = node
        .reachable_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(':')
        .next()
        .unwrap_or(hostname)
        .to_owned();

    let mut runner = match TcpStream::connect((runner_host.as_str(), ssh_port)).await {
        Ok(stream) => stream,
        Err(err) => {
            let msg = format!("ERROR cannot reach runner ssh port: {err}\n");
            client.write_all(msg.as_bytes()).await?;
            return Ok(());
        }
    };

    client.write_all(b"SUCCESS\n").await?;
    tokio::io::copy_bidirectional(&mut client, &mut runner).await?;
    Ok(())
}
