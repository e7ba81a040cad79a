//! HTTP API handlers

use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::CodecConfig;
use crate::control::server::ControlState;
use crate::engine::{AudioPipeline, DeviceFault, PipelineStatus, StatsSnapshot};
use crate::protocol::AudioDeviceInfo;

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiResult<T> {
    (StatusCode::OK, Json(ApiResponse::ok(data)))
}

fn failed<T>(status: StatusCode, error: impl ToString) -> ApiResult<T> {
    (status, Json(ApiResponse::error(error.to_string())))
}

/// Node status plus the most recent device fault, if any
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    #[serde(flatten)]
    pub pipeline: PipelineStatus,
    pub uptime_seconds: u64,
    pub device_fault: Option<DeviceFault>,
}

pub async fn get_status(State(state): State<Arc<ControlState>>) -> Json<ApiResponse<NodeStatus>> {
    Json(ApiResponse::ok(NodeStatus {
        pipeline: state.pipeline.status(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        device_fault: state.pipeline.last_device_fault(),
    }))
}

pub async fn get_stats(State(state): State<Arc<ControlState>>) -> Json<ApiResponse<StatsSnapshot>> {
    Json(ApiResponse::ok(state.pipeline.stats()))
}

pub async fn get_devices(State(state): State<Arc<ControlState>>) -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    Json(ApiResponse::ok(state.pipeline.list_devices()))
}

/// Run a device transition off the async workers
///
/// Stream commands wait on the device owner thread, which can take up to
/// the audio command timeout.
async fn device_transition(
    state: &ControlState,
    transition: fn(&AudioPipeline) -> crate::Result<()>,
) -> ApiResult<()> {
    let pipeline = state.pipeline.clone();
    match tokio::task::spawn_blocking(move || transition(&pipeline)).await {
        Ok(Ok(())) => ok(()),
        Ok(Err(e)) => failed(StatusCode::INTERNAL_SERVER_ERROR, e),
        Err(e) => failed(StatusCode::INTERNAL_SERVER_ERROR, format!("device task failed: {}", e)),
    }
}

pub async fn start_capture(State(state): State<Arc<ControlState>>) -> ApiResult<()> {
    device_transition(&state, AudioPipeline::start_capture).await
}

pub async fn stop_capture(State(state): State<Arc<ControlState>>) -> ApiResult<()> {
    device_transition(&state, AudioPipeline::stop_capture).await
}

pub async fn start_playback(State(state): State<Arc<ControlState>>) -> ApiResult<()> {
    device_transition(&state, AudioPipeline::start_playback).await
}

pub async fn stop_playback(State(state): State<Arc<ControlState>>) -> ApiResult<()> {
    device_transition(&state, AudioPipeline::stop_playback).await
}

#[derive(Debug, Deserialize)]
pub struct PeerRequest {
    /// `ip` or `ip:port`
    pub address: String,
}

pub async fn add_peer(
    State(state): State<Arc<ControlState>>,
    Json(req): Json<PeerRequest>,
) -> ApiResult<String> {
    match state.pipeline.add_peer_address(&req.address) {
        Ok(peer) => (StatusCode::CREATED, Json(ApiResponse::ok(peer.to_string()))),
        Err(e) => failed(StatusCode::BAD_REQUEST, e),
    }
}

pub async fn clear_peers(State(state): State<Arc<ControlState>>) -> ApiResult<()> {
    state.pipeline.clear_peers();
    ok(())
}

pub async fn get_codec(State(state): State<Arc<ControlState>>) -> Json<ApiResponse<CodecConfig>> {
    Json(ApiResponse::ok(state.pipeline.codec_config()))
}

pub async fn set_codec(
    State(state): State<Arc<ControlState>>,
    Json(config): Json<CodecConfig>,
) -> ApiResult<CodecConfig> {
    match state.pipeline.configure_codec(&config) {
        Ok(applied) => ok(applied),
        Err(e) => failed(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Accept a raw RTP datagram received by the host
pub async fn enqueue_packet(State(state): State<Arc<ControlState>>, body: Bytes) -> ApiResult<()> {
    if state.pipeline.enqueue_packet(&body) {
        (StatusCode::ACCEPTED, Json(ApiResponse::ok(())))
    } else {
        failed(StatusCode::UNPROCESSABLE_ENTITY, "datagram rejected")
    }
}
