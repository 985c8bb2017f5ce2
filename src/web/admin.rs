use crate::error::StreamError;
use crate::registry::StreamStats;
use crate::state::SharedState;
use crate::supervisor::StartOptions;
use crate::watcher::HlsDirReport;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

/// 启动流请求体
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub source_url: String,
    /// 跳过预检的操作员覆盖
    #[serde(default)]
    pub forced: bool,
    /// 可选的调用方指定 id (通常是摄像头编号)
    #[serde(default)]
    pub stream_id: Option<String>,
}

/// 错误分类映射到 HTTP 状态码, 调用方据此决定重试还是强制
fn error_status(err: &StreamError) -> StatusCode {
    match err {
        StreamError::InvalidUrl { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        StreamError::DuplicateStream(_) => StatusCode::CONFLICT,
        StreamError::Unreachable { .. } | StreamError::ProbeFailed { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// 获取系统状态 API
/// 返回系统的内存和负载信息, 作为 JSON 响应
pub async fn sys_status() -> Json<serde_json::Value> {
    let mem = sys_info::mem_info()
        .map(|m| (m.total, m.avail))
        .unwrap_or((0, 0));
    let load = sys_info::loadavg().map(|l| l.one).unwrap_or(0.0);

    Json(serde_json::json!({
        "mem_total": mem.0 / 1024, // 转换为MB
        "mem_avail": mem.1 / 1024, // 转换为MB
        "load_avg": load,
    }))
}

/// 手动启动流 API
pub async fn handle_start(
    State(state): State<SharedState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let started = state
        .supervisor
        .start_stream(
            &req.source_url,
            StartOptions {
                forced: req.forced,
                stream_id: req.stream_id,
            },
        )
        .await
        .map_err(|e| (error_status(&e), e.to_string()))?;

    Ok(Json(serde_json::json!({
        "stream_id": started.stream_id,
        "hls_url": started.hls_url,
    })))
}

/// 手动停止流 API; 未知 id 也返回成功
pub async fn handle_stop(
    State(state): State<SharedState>,
    Path(stream_id): Path<String>,
) -> Json<serde_json::Value> {
    state.supervisor.stop_stream(&stream_id);
    Json(serde_json::json!({
        "stream_id": stream_id,
        "stopped": true,
    }))
}

/// 流统计 API, 供监控面板使用
pub async fn list_streams(State(state): State<SharedState>) -> Json<StreamStats> {
    Json(state.supervisor.get_stats())
}

/// 流是否已就绪可播放
pub async fn stream_active(
    State(state): State<SharedState>,
    Path(stream_id): Path<String>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "stream_id": stream_id,
        "active": state.supervisor.is_active(&stream_id),
    }))
}

/// 输出目录诊断 API
pub async fn stream_readiness(
    State(state): State<SharedState>,
    Path(stream_id): Path<String>,
) -> Result<Json<HlsDirReport>, (StatusCode, String)> {
    match state.supervisor.check_readiness(&stream_id).await {
        Some(report) => Ok(Json(report)),
        None => Err((StatusCode::NOT_FOUND, "Stream not found".to_string())),
    }
}
