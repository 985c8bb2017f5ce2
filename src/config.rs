use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// 外部转码/探测工具路径
    /// 二者缺一不可, 启动期校验, 缺失视为致命配置错误
    #[serde(default = "default_ffmpeg_binary")]
    pub ffmpeg_binary: String,
    #[serde(default = "default_ffprobe_binary")]
    pub ffprobe_binary: String,

    /// HLS 切片存储根目录
    /// 建议配置为 /dev/shm/cam-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,

    /// 后台监控 (存活检查 + 空闲回收) 的扫描间隔
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    /// HLS 切片时长 (秒)
    #[serde(default = "default_segment_seconds")]
    pub segment_seconds: u32,
    /// 播放列表保留的切片数量, 旧切片由转码器滚动删除
    #[serde(default = "default_playlist_size")]
    pub playlist_size: u32,

    /// TCP 可达性检测超时
    #[serde(default = "default_reachability_timeout_ms")]
    pub reachability_timeout_ms: u64,
    /// 单个传输协议候选的 ffprobe 探测超时
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// 等待转码器产出首个可播放列表的超时
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// 就绪检测的轮询间隔
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,

    /// 优雅停止的宽限期, 超过后强杀
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// 切片数量停止增长超过该窗口的流被回收 (0 表示关闭)
    #[serde(default = "default_idle_eviction_ms")]
    pub idle_eviction_ms: u64,

    /// 并发启动预检的上限 (按启动速率设定, 不是按活跃流数量)
    #[serde(default = "default_max_concurrent_starts")]
    pub max_concurrent_starts: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            segment_seconds: default_segment_seconds(),
            playlist_size: default_playlist_size(),
            reachability_timeout_ms: default_reachability_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            ready_poll_ms: default_ready_poll_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            idle_eviction_ms: default_idle_eviction_ms(),
            max_concurrent_starts: default_max_concurrent_starts(),
        }
    }
}

fn default_ffmpeg_binary() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_binary() -> String {
    "ffprobe".to_string()
}

fn default_hls_root() -> String {
    "./static/hls".to_string()
}

fn default_monitor_interval_ms() -> u64 {
    5000
}

fn default_segment_seconds() -> u32 {
    2
}

fn default_playlist_size() -> u32 {
    5
}

fn default_reachability_timeout_ms() -> u64 {
    8000
}

fn default_probe_timeout_ms() -> u64 {
    15000
}

fn default_ready_timeout_ms() -> u64 {
    20000
}

fn default_ready_poll_ms() -> u64 {
    500
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_idle_eviction_ms() -> u64 {
    120_000
}

fn default_max_concurrent_starts() -> usize {
    4
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}
