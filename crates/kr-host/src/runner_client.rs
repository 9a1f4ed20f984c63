//! Host → Runner administrative calls (§4.3, §6): kill, pause/resume, and
//! VPS stop/restart all forward the action to the Runner that owns the
//! task, after the Host's own bookkeeping is updated.

use std::time::Duration;

use kr_common::ErrorKind;
use serde::Serialize;

use crate::error::AppError;

const RUNNER_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct KillBody {
    task_id: u64,
}

/// POST `{reachable_url}/api/kill`.
pub async fn kill(reachable_url: &str, task_id: u64) -> Result<(), AppError> {
    post_json(reachable_url, "/api/kill", &KillBody { task_id }).await
}

/// POST `{reachable_url}/api/command/{task_id}/{action}`.
pub async fn command(reachable_url: &str, task_id: u64, action: &str) -> Result<(), AppError> {
    post_empty(reachable_url, &format!("/api/command/{task_id}/{action}")).await
}

/// POST `{reachable_url}/api/vps/stop/{task_id}`.
pub async fn vps_stop(reachable_url: &str, task_id: u64) -> Result<(), AppError> {
    post_empty(reachable_url, &format!("/api/vps/stop/{task_id}")).await
}

/// POST `{reachable_url}/api/vps/restart/{task_id}`.
pub async fn vps_restart(reachable_url: &str, task_id: u64) -> Result<(), AppError> {
    post_empty(reachable_url, &format!("/api/vps/restart/{task_id}")).await
}

async fn post_empty(reachable_url: &str, path: &str) -> Result<(), AppError> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{reachable_url}{path}"))
        .timeout(RUNNER_HTTP_TIMEOUT)
        .send()
        .await
        .map_err(map_send_error)?;
    check_status(response).await
}

async fn post_json(reachable_url: &str, path: &str, body: &impl Serialize) -> Result<(), AppError> {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{reachable_url}{path}"))
        .json(body)
        .timeout(RUNNER_HTTP_TIMEOUT)
        .send()
        .await
        .map_err(map_send_error)?;
    check_status(response).await
}

async fn check_status(response: reqwest::Response) -> Result<(), AppError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(AppError::new(
            ErrorKind::RunnerUnavailable,
            format!("runner responded with status {}", response.status()),
        ))
    }
}

fn map_send_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::new(ErrorKind::UpstreamTimeout, err.to_string())
    } else {
        AppError::new(ErrorKind::RunnerUnavailable, err.to_string())
    }
}
