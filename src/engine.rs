use crate::config::AppConfig;
use crate::error::StreamError;
use crate::probe::Transport;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// 转码器写入输出目录的播放列表文件名
pub const PLAYLIST_NAME: &str = "playlist.m3u8";

/// 转码进程管理器
///
/// FFmpeg 子进程句柄的唯一持有者; 注册表只存元数据,
/// 杀进程的权力只在这里
pub struct Engine {
    ffmpeg_binary: String,
    segment_seconds: u32,
    playlist_size: u32,
    stop_grace: Duration,
    procs: Mutex<HashMap<String, Child>>,
}

impl Engine {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            ffmpeg_binary: config.server.ffmpeg_binary.clone(),
            segment_seconds: config.streaming.segment_seconds,
            playlist_size: config.streaming.playlist_size,
            stop_grace: Duration::from_millis(config.streaming.stop_grace_ms),
            procs: Mutex::new(HashMap::new()),
        }
    }

    /// 为指定流启动 FFmpeg 转码进程, 不等待就绪
    ///
    /// # 副作用
    /// - 启动子进程并持有其句柄
    /// - 后台任务消费 stderr, 避免管道写满阻塞转码器
    ///
    /// # 错误处理
    /// - 系统内存不足时拒绝启动
    /// - 可执行文件缺失或启动失败返回 Spawn 错误, 不做重试
    pub fn start(
        &self,
        stream_id: &str,
        source_url: &str,
        transport: Transport,
        output_dir: &Path,
    ) -> Result<(), StreamError> {
        // 1. 检查系统内存是否足够
        match sys_info::mem_info() {
            Ok(mem) => {
                if mem.avail < 5120 {
                    return Err(StreamError::Spawn(format!(
                        "insufficient system memory ({} KB available)",
                        mem.avail
                    )));
                }
            }
            Err(e) => {
                // 拿不到内存信息只记录警告, 不阻断启动
                warn!("Failed to check memory usage: {}", e);
            }
        }

        // 2. 构建 FFmpeg 命令
        let mut cmd = Command::new(&self.ffmpeg_binary);
        cmd.arg("-hide_banner").arg("-y");
        if let Some(t) = transport.as_arg() {
            cmd.arg("-rtsp_transport").arg(t);
        }
        cmd.arg("-fflags")
            .arg("+genpts")
            .arg("-avoid_negative_ts")
            .arg("make_zero")
            .arg("-i")
            .arg(source_url)
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("ultrafast")
            .arg("-tune")
            .arg("zerolatency")
            .arg("-profile:v")
            .arg("baseline")
            .arg("-an")
            .arg("-f")
            .arg("hls")
            .arg("-hls_time")
            .arg(self.segment_seconds.to_string())
            .arg("-hls_list_size")
            .arg(self.playlist_size.to_string())
            .arg("-hls_flags")
            .arg("delete_segments+independent_segments")
            .arg("-hls_segment_type")
            .arg("mpegts")
            .arg(output_dir.join(PLAYLIST_NAME));

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        // 3. 启动子进程
        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn FFmpeg process: {}", e);
            StreamError::Spawn(format!("{}: {}", self.ffmpeg_binary, e))
        })?;

        // 4. 消费转码器输出, 保留排错信息
        if let Some(stderr) = child.stderr.take() {
            let id = stream_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg [{}]: {}", id, line);
                }
            });
        }

        // 5. 登记进程句柄
        {
            let mut procs = self.procs.lock().unwrap();
            if procs.contains_key(stream_id) {
                // 注册表应当保证同一 id 不会二次启动
                let _ = child.start_kill();
                return Err(StreamError::InvariantViolation(format!(
                    "transcoder already running for stream [{}]",
                    stream_id
                )));
            }
            procs.insert(stream_id.to_string(), child);
        }

        info!(
            "Transcoder started for stream [{}] ({} transport)",
            stream_id, transport
        );
        Ok(())
    }

    /// 停止流的转码进程: 先优雅终止, 宽限期后强杀
    ///
    /// 无论哪条路径, 子进程都会被回收; 未知 id 是空操作
    pub async fn stop(&self, stream_id: &str) {
        let child = self.procs.lock().unwrap().remove(stream_id);
        let Some(mut child) = child else {
            return;
        };

        // 优雅终止, 让转码器写完当前切片
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Transcoder for [{}] exited with {}", stream_id, status);
            }
            Ok(Err(e)) => {
                warn!("Failed to reap transcoder for [{}]: {}", stream_id, e);
            }
            Err(_) => {
                warn!(
                    "Transcoder for [{}] ignored graceful stop. Force killing.",
                    stream_id
                );
                if let Err(e) = child.kill().await {
                    error!("Force kill failed for [{}]: {}", stream_id, e);
                }
            }
        }
    }

    /// 非阻塞存活检查; 观察到退出时顺带回收句柄
    pub fn is_alive(&self, stream_id: &str) -> bool {
        let mut procs = self.procs.lock().unwrap();
        let alive = match procs.get_mut(stream_id) {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    debug!("Transcoder for [{}] already exited with {}", stream_id, status);
                    false
                }
                Err(e) => {
                    error!("Process monitor error [{}]: {}", stream_id, e);
                    false
                }
            },
            None => return false,
        };
        if !alive {
            procs.remove(stream_id);
        }
        alive
    }

    /// 当前持有进程句柄的流 id 集合
    pub fn tracked_ids(&self) -> Vec<String> {
        self.procs.lock().unwrap().keys().cloned().collect()
    }
}

/// 外部工具链自检: 工具必须能在限时内应答 -version
///
/// 缺失属于致命配置错误, 在启动期暴露而不是留到第一次拉流
pub async fn assert_binary_available(binary: &str) -> Result<(), StreamError> {
    let mut child = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StreamError::Spawn(format!("{} not available: {}", binary, e)))?;

    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(StreamError::Spawn(format!(
            "{} -version exited with {}",
            binary, status
        ))),
        Ok(Err(e)) => Err(StreamError::Spawn(format!("wait {}: {}", binary, e))),
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(StreamError::Spawn(format!(
                "{} -version timed out",
                binary
            )))
        }
    }
}
