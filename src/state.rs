use crate::config::AppConfig;
use crate::supervisor::StreamSupervisor;
use std::sync::Arc;

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    /// 流监督者 (内部可克隆的共享句柄)
    pub supervisor: StreamSupervisor,
}

pub type SharedState = Arc<AppState>;
