use crate::error::StreamError;
use crate::probe::Transport;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::error;

/// 流状态机
///
/// Starting -> {Running, Failed, Stopped}
/// Running <-> Failed (由存活检查驱动), 二者均可 -> Stopped
/// 其余迁移是注册表被破坏的信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Starting,
    Running,
    Failed,
    Stopped,
}

fn transition_allowed(from: StreamState, to: StreamState) -> bool {
    use StreamState::*;
    matches!(
        (from, to),
        (Starting, Running)
            | (Starting, Failed)
            | (Starting, Stopped)
            | (Running, Failed)
            | (Running, Stopped)
            | (Failed, Running)
            | (Failed, Stopped)
    )
}

/// 注册表中的流句柄 (纯元数据, OS 进程句柄由转码引擎独占持有)
#[derive(Debug, Clone)]
pub struct StreamHandle {
    pub stream_id: String,
    pub source_url: String,
    pub output_dir: PathBuf,
    pub state: StreamState,
    pub transport: Transport,
    /// 操作员跳过预检强制启动的流
    pub forced: bool,
    pub started_at: Instant,
    pub last_health_check_at: Instant,
    /// 空闲回收记账: 上次观察到的切片数量与最近一次增长时刻
    pub last_segment_count: usize,
    pub last_progress_at: Instant,
}

impl StreamHandle {
    pub fn new(
        stream_id: String,
        source_url: String,
        output_dir: PathBuf,
        transport: Transport,
        forced: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream_id,
            source_url,
            output_dir,
            state: StreamState::Starting,
            transport,
            forced,
            started_at: now,
            last_health_check_at: now,
            last_segment_count: 0,
            last_progress_at: now,
        }
    }
}

/// 按需计算的流统计快照, 从不持久化
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub active_count: usize,
    pub starting_count: usize,
    pub failed_count: usize,
    pub stream_ids: Vec<String>,
}

/// 流注册表: stream_id -> StreamHandle 的唯一持有者
///
/// 互斥锁保证对单个 id 的插入/迁移/删除是原子的,
/// 同一 id 的并发启动在 try_insert 处被拒绝
#[derive(Default)]
pub struct StreamRegistry {
    handles: Mutex<HashMap<String, StreamHandle>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新句柄; 同一 id 已存在时拒绝, 不覆盖在运行的流
    pub fn try_insert(&self, handle: StreamHandle) -> Result<(), StreamError> {
        let mut handles = self.handles.lock().unwrap();
        if handles.contains_key(&handle.stream_id) {
            return Err(StreamError::DuplicateStream(handle.stream_id));
        }
        handles.insert(handle.stream_id.clone(), handle);
        Ok(())
    }

    pub fn remove(&self, stream_id: &str) -> Option<StreamHandle> {
        self.handles.lock().unwrap().remove(stream_id)
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamHandle> {
        self.handles.lock().unwrap().get(stream_id).cloned()
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.handles.lock().unwrap().contains_key(stream_id)
    }

    pub fn is_running(&self, stream_id: &str) -> bool {
        self.handles
            .lock()
            .unwrap()
            .get(stream_id)
            .map(|h| h.state == StreamState::Running)
            .unwrap_or(false)
    }

    /// 状态迁移
    ///
    /// - `Ok(true)` 迁移完成
    /// - `Ok(false)` 句柄已不存在 (流在并发路径上被停止), 调用方按无事发生处理
    /// - `Err(..)` 非法迁移, 大声失败
    pub fn transition(&self, stream_id: &str, to: StreamState) -> Result<bool, StreamError> {
        let mut handles = self.handles.lock().unwrap();
        let Some(handle) = handles.get_mut(stream_id) else {
            return Ok(false);
        };
        if !transition_allowed(handle.state, to) {
            let detail = format!(
                "illegal transition {:?} -> {:?} for stream [{}]",
                handle.state, to, stream_id
            );
            error!("{}", detail);
            return Err(StreamError::InvariantViolation(detail));
        }
        handle.state = to;
        Ok(true)
    }

    /// 就绪重试切换传输协议后同步句柄记录
    pub fn set_transport(&self, stream_id: &str, transport: Transport) {
        if let Some(handle) = self.handles.lock().unwrap().get_mut(stream_id) {
            handle.transport = transport;
        }
    }

    pub fn mark_health_check(&self, stream_id: &str) {
        if let Some(handle) = self.handles.lock().unwrap().get_mut(stream_id) {
            handle.last_health_check_at = Instant::now();
        }
    }

    /// 记录一次切片数量观察, 返回距最近一次增长的停滞时长
    ///
    /// 数量增长会重置停滞时钟; 句柄不存在返回 None
    pub fn note_progress(&self, stream_id: &str, segment_count: usize) -> Option<Duration> {
        let mut handles = self.handles.lock().unwrap();
        let handle = handles.get_mut(stream_id)?;
        let now = Instant::now();
        if segment_count > handle.last_segment_count {
            handle.last_segment_count = segment_count;
            handle.last_progress_at = now;
            return Some(Duration::ZERO);
        }
        Some(now.duration_since(handle.last_progress_at))
    }

    pub fn ids_in(&self, state: StreamState) -> Vec<String> {
        self.handles
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.state == state)
            .map(|h| h.stream_id.clone())
            .collect()
    }

    pub fn snapshot_all(&self) -> Vec<StreamHandle> {
        self.handles.lock().unwrap().values().cloned().collect()
    }

    pub fn stats(&self) -> StreamStats {
        let handles = self.handles.lock().unwrap();
        let mut stats = StreamStats {
            active_count: 0,
            starting_count: 0,
            failed_count: 0,
            stream_ids: Vec::with_capacity(handles.len()),
        };
        for handle in handles.values() {
            match handle.state {
                StreamState::Running => stats.active_count += 1,
                StreamState::Starting => stats.starting_count += 1,
                StreamState::Failed => stats.failed_count += 1,
                StreamState::Stopped => {}
            }
            stats.stream_ids.push(handle.stream_id.clone());
        }
        stats.stream_ids.sort();
        stats
    }
}
