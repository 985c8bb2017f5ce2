mod config;
mod engine;
mod error;
mod probe;
mod registry;
mod state;
mod supervisor;
mod watcher;
mod web;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::AppConfig;
use probe::FfprobeProber;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use supervisor::StreamSupervisor;
use tracing::info;

/// Cam Link - 校园摄像头流媒体网关
/// 解析命令行参数, 校验外部工具链, 启动 HTTP 服务及后台监控
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "cam-link.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志系统, 设置格式
    tracing_subscriber::fmt::init();

    // 解析命令行参数, 获取配置文件路径
    let args = Args::parse();

    // 加载配置文件
    let config = AppConfig::load(&args.config)?;
    info!("Cam Link initialized. HLS Root: {}", config.server.hls_root);

    // 外部工具缺失属于致命配置错误, 启动期一次性校验
    engine::assert_binary_available(&config.server.ffmpeg_binary).await?;
    engine::assert_binary_available(&config.server.ffprobe_binary).await?;

    // 组装流监督者: 生产环境使用基于 ffprobe 的预检实现
    let prober = FfprobeProber::new(
        config.server.ffprobe_binary.clone(),
        Duration::from_millis(config.streaming.reachability_timeout_ms),
        Duration::from_millis(config.streaming.probe_timeout_ms),
    );
    let supervisor = StreamSupervisor::new(config.clone(), Arc::new(prober));

    // 启动后台监控 (存活检查 + 空闲回收)
    tokio::spawn(supervisor.clone().run_monitor());

    // 初始化全局状态
    let state = Arc::new(AppState {
        config: config.clone(),
        supervisor,
    });

    // 注册HTTP路由
    let app = Router::new()
        .route("/sys/status", get(web::admin::sys_status)) // 系统状态
        .route("/streams", get(web::admin::list_streams)) // 流统计
        .route("/streams/start", post(web::admin::handle_start)) // 启动流
        .route("/streams/:id/stop", post(web::admin::handle_stop)) // 停止流
        .route("/streams/:id/active", get(web::admin::stream_active)) // 就绪查询
        .route("/streams/:id/readiness", get(web::admin::stream_readiness)) // 目录诊断
        .route(
            "/hls/:stream_id/:file_name",
            get(web::hls::serve_hls_file), // 获取HLS文件
        )
        .with_state(state.clone());

    // 启动HTTP服务, 监听指定的地址和端口
    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
