use crate::engine::PLAYLIST_NAME;
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

/// HLS 输出目录诊断信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct HlsDirReport {
    pub exists: bool,
    pub segment_count: usize,
    pub playlist_bytes: u64,
    /// 目录内最新文件的修改时间 (unix 毫秒)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_ms: Option<u64>,
}

/// 播放列表是否已引用至少一个切片
///
/// 转码器异步落盘且有启动延迟, 轮询文件系统是唯一
/// 跨工具版本稳定的就绪信号, 不依赖 stdout 格式
pub async fn playlist_ready(output_dir: &Path) -> bool {
    let Ok(content) = fs::read_to_string(output_dir.join(PLAYLIST_NAME)).await else {
        return false;
    };
    content.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with('#')
    })
}

/// 轮询输出目录直到播放列表可播放, 或超时返回 false
pub async fn wait_for_ready(output_dir: &Path, timeout: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if playlist_ready(output_dir).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

/// 目录诊断: 切片数量 / 播放列表大小 / 最后修改时间
pub async fn inspect(output_dir: &Path) -> HlsDirReport {
    let mut report = HlsDirReport::default();
    let Ok(mut entries) = fs::read_dir(output_dir).await else {
        return report;
    };
    report.exists = true;

    let mut newest: Option<SystemTime> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        match entry.path().extension().and_then(|e| e.to_str()) {
            Some("ts") => report.segment_count += 1,
            Some("m3u8") => report.playlist_bytes = metadata.len(),
            _ => {}
        }

        if let Ok(modified) = metadata.modified() {
            if newest.map(|n| modified > n).unwrap_or(true) {
                newest = Some(modified);
            }
        }
    }

    report.last_modified_ms = newest.map(|t| {
        t.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    });
    report
}
