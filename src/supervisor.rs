use crate::config::AppConfig;
use crate::engine::{self, Engine};
use crate::error::StreamError;
use crate::probe::{self, Prober, Transport};
use crate::registry::{StreamHandle, StreamRegistry, StreamState, StreamStats};
use crate::watcher::{self, HlsDirReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

/// 流生命周期事件, 供监控协作方订阅
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream_id: String,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    /// 播放列表首次可播放
    Ready,
    /// 重试后仍未在限时内产出播放列表
    ReadinessTimeout,
    /// 进程意外退出
    Crashed,
    /// 切片停止增长被回收
    Evicted,
    /// 显式停止
    Stopped,
}

/// startStream 请求选项
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// 跳过连通性预检直接启动转码
    /// 用于固件拒绝探测工具但接受真实拉流的摄像头
    pub forced: bool,
    /// 调用方指定的流 id, 缺省自动生成
    pub stream_id: Option<String>,
}

/// startStream 响应; 真正的就绪需要 10-20 秒, 调用方另行轮询
#[derive(Debug, Clone, Serialize)]
pub struct StartedStream {
    pub stream_id: String,
    pub hls_url: String,
}

enum ReadinessOutcome {
    Ready,
    ProcessDied,
    TimedOut,
}

struct Inner {
    config: AppConfig,
    registry: StreamRegistry,
    engine: Engine,
    prober: Arc<dyn Prober>,
    /// 预检/探测会阻塞数秒, 并发启动数按启动速率限流
    start_permits: Semaphore,
    events: broadcast::Sender<StreamEvent>,
}

/// 流监督者: 预检 -> 启动 -> 就绪监视 -> 查询/停止 的门面
///
/// 注册表条目只由这里插入/移除; 进程只由转码引擎终止
#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

impl StreamSupervisor {
    pub fn new(config: AppConfig, prober: Arc<dyn Prober>) -> Self {
        let engine = Engine::new(&config);
        let start_permits = Semaphore::new(config.streaming.max_concurrent_starts);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: StreamRegistry::new(),
                engine,
                prober,
                start_permits,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, stream_id: &str, kind: StreamEventKind) {
        // 没有订阅者不是错误
        let _ = self.inner.events.send(StreamEvent {
            stream_id: stream_id.to_string(),
            kind,
        });
    }

    /// 启动一路流
    ///
    /// # 流程
    /// - 格式校验永远执行, 强制模式也不接受畸形 URL
    /// - 非强制模式: TCP 可达性检测 + ffprobe 传输协议协商, 失败同步返回
    ///   分类错误且不产生任何进程
    /// - 注册 Starting 句柄 (同一 id 的并发启动在这里被拒绝), 启动转码进程,
    ///   再异步等待就绪; 本函数立即返回流地址
    pub async fn start_stream(
        &self,
        source_url: &str,
        opts: StartOptions,
    ) -> Result<StartedStream, StreamError> {
        let _permit = self
            .inner
            .start_permits
            .acquire()
            .await
            .expect("start semaphore closed");

        // 1. 格式校验
        let target = probe::validate_format(source_url)?;

        // 2. 连通性预检 (强制模式跳过)
        let transport = if opts.forced {
            warn!("FORCE MODE: skipping connectivity checks for {}", source_url);
            Transport::Tcp
        } else {
            let report = self
                .inner
                .prober
                .test_reachability(&target.host, target.port)
                .await;
            if !report.reachable {
                return Err(StreamError::Unreachable {
                    host: target.host,
                    port: target.port,
                    detail: report
                        .error_detail
                        .unwrap_or_else(|| "connect failed".to_string()),
                });
            }
            self.inner.prober.probe_stream(source_url).await?
        };

        // 3. 注册 Starting 句柄, 占住 id
        let stream_id = opts
            .stream_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let output_dir = PathBuf::from(&self.inner.config.server.hls_root).join(&stream_id);
        self.inner.registry.try_insert(StreamHandle::new(
            stream_id.clone(),
            source_url.to_string(),
            output_dir.clone(),
            transport,
            opts.forced,
        ))?;

        // 4. 启动转码进程; 失败时撤销注册
        if let Err(e) = self.launch(&stream_id, source_url, transport, &output_dir).await {
            self.inner.registry.remove(&stream_id);
            return Err(e);
        }

        // 5. 异步等待就绪, 调用方立即拿到流地址并轮询状态
        let supervisor = self.clone();
        let id = stream_id.clone();
        let url = source_url.to_string();
        tokio::spawn(async move {
            supervisor.watch_readiness(id, url).await;
        });

        info!(
            "Stream [{}] starting from {} ({} transport)",
            stream_id, source_url, transport
        );
        Ok(StartedStream {
            hls_url: format!("/hls/{}/{}", stream_id, engine::PLAYLIST_NAME),
            stream_id,
        })
    }

    /// 重建输出目录并拉起转码进程
    /// 残留的旧切片会被当作就绪信号, 必须先清掉
    async fn launch(
        &self,
        stream_id: &str,
        source_url: &str,
        transport: Transport,
        output_dir: &Path,
    ) -> Result<(), StreamError> {
        let _ = fs::remove_dir_all(output_dir).await;
        fs::create_dir_all(output_dir).await?;
        self.inner
            .engine
            .start(stream_id, source_url, transport, output_dir)
    }

    /// 等待转码器产出首个可播放的播放列表
    ///
    /// 超时则停掉进程并换下一个传输协议候选重试一次,
    /// 再失败标记 Failed; 进程提前退出直接 Failed 不重试
    async fn watch_readiness(self, stream_id: String, source_url: String) {
        let Some(handle) = self.inner.registry.get(&stream_id) else {
            return; // 已被并发停止
        };
        let mut transport = handle.transport;
        let output_dir = handle.output_dir.clone();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.await_playlist(&stream_id, &output_dir).await {
                ReadinessOutcome::Ready => {
                    match self.inner.registry.transition(&stream_id, StreamState::Running) {
                        Ok(true) => {
                            info!(
                                "Stream [{}] is live after {} attempt(s)",
                                stream_id, attempts
                            );
                            self.emit(&stream_id, StreamEventKind::Ready);
                        }
                        Ok(false) => {} // 流已被停止
                        Err(e) => error!("Ready transition rejected for [{}]: {}", stream_id, e),
                    }
                    return;
                }
                ReadinessOutcome::ProcessDied => {
                    warn!(
                        "Stream [{}] transcoder exited before producing output",
                        stream_id
                    );
                    self.fail(&stream_id, StreamEventKind::Crashed).await;
                    return;
                }
                ReadinessOutcome::TimedOut => {
                    self.inner.engine.stop(&stream_id).await;
                    if attempts == 1 {
                        if let Some(next) = transport.next_candidate() {
                            warn!(
                                "Stream [{}] not ready in time. Retrying with {} transport.",
                                stream_id, next
                            );
                            if self.relaunch(&stream_id, &source_url, next, &output_dir).await {
                                transport = next;
                                continue;
                            }
                            return; // 流已被停止或重启失败, relaunch 内已处理
                        }
                    }
                    let err = StreamError::ReadinessTimeout {
                        stream_id: stream_id.clone(),
                        waited_ms: u64::from(attempts)
                            * self.inner.config.streaming.ready_timeout_ms,
                    };
                    warn!("{}. Marking failed.", err);
                    self.fail(&stream_id, StreamEventKind::ReadinessTimeout).await;
                    return;
                }
            }
        }
    }

    /// 以 ready_poll 为步长轮询播放列表, 同时盯住进程存活
    async fn await_playlist(&self, stream_id: &str, output_dir: &Path) -> ReadinessOutcome {
        let timeout = Duration::from_millis(self.inner.config.streaming.ready_timeout_ms);
        let poll = Duration::from_millis(self.inner.config.streaming.ready_poll_ms);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if watcher::playlist_ready(output_dir).await {
                return ReadinessOutcome::Ready;
            }
            if !self.inner.engine.is_alive(stream_id) {
                return ReadinessOutcome::ProcessDied;
            }
            if tokio::time::Instant::now() >= deadline {
                return ReadinessOutcome::TimedOut;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// 就绪超时后的单次换协议重启; 返回 false 表示没有重启成功
    async fn relaunch(
        &self,
        stream_id: &str,
        source_url: &str,
        transport: Transport,
        output_dir: &Path,
    ) -> bool {
        if !self.inner.registry.contains(stream_id) {
            return false; // 流已被停止
        }
        match self.launch(stream_id, source_url, transport, output_dir).await {
            Ok(()) => {
                self.inner.registry.set_transport(stream_id, transport);
                true
            }
            Err(e) => {
                error!("Retry launch failed for [{}]: {}", stream_id, e);
                self.fail(stream_id, StreamEventKind::ReadinessTimeout).await;
                false
            }
        }
    }

    /// 进程先停干净, 再把句柄标成 Failed
    async fn fail(&self, stream_id: &str, kind: StreamEventKind) {
        self.inner.engine.stop(stream_id).await;
        match self.inner.registry.transition(stream_id, StreamState::Failed) {
            Ok(true) => self.emit(stream_id, kind),
            Ok(false) => {}
            Err(e) => error!("Failure transition rejected for [{}]: {}", stream_id, e),
        }
    }

    /// 停止并移除流; 未知 id 是幂等空操作
    ///
    /// 注册表条目同步移除 (isActive 立即变 false),
    /// 进程回收与目录清理在后台完成, 调用方不会看到半停止状态
    pub fn stop_stream(&self, stream_id: &str) {
        let Some(handle) = self.inner.registry.remove(stream_id) else {
            return;
        };
        info!("Stopping stream: {}", stream_id);

        let supervisor = self.clone();
        let id = handle.stream_id.clone();
        tokio::spawn(async move {
            supervisor.inner.engine.stop(&id).await;
            if let Err(e) = fs::remove_dir_all(&handle.output_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to clean up HLS directory for [{}]: {}", id, e);
                }
            }
            info!("Stream stopped: {}", id);
            supervisor.emit(&id, StreamEventKind::Stopped);
        });
    }

    pub fn get_stats(&self) -> StreamStats {
        self.inner.registry.stats()
    }

    pub fn is_active(&self, stream_id: &str) -> bool {
        self.inner.registry.is_running(stream_id)
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.inner.registry.contains(stream_id)
    }

    /// 输出目录诊断, 未知 id 返回 None
    pub async fn check_readiness(&self, stream_id: &str) -> Option<HlsDirReport> {
        let handle = self.inner.registry.get(stream_id)?;
        Some(watcher::inspect(&handle.output_dir).await)
    }

    /// 后台监控循环: 存活检查 + 空闲回收
    /// 单一调度任务, 避免每条流各起一个扫描器
    pub async fn run_monitor(self) {
        let interval_ms = self.inner.config.server.monitor_interval_ms;
        let idle_ms = self.inner.config.streaming.idle_eviction_ms;
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            interval.tick().await;
            self.health_sweep().await;
            if idle_ms > 0 {
                self.evict_stale(Duration::from_millis(idle_ms)).await;
            }
        }
    }

    /// 存活检查: Running 流的进程意外退出 -> Failed, 不自动重启
    pub async fn health_sweep(&self) {
        for id in self.inner.registry.ids_in(StreamState::Running) {
            if self.inner.engine.is_alive(&id) {
                self.inner.registry.mark_health_check(&id);
                continue;
            }
            warn!("Stream [{}] exited unexpectedly. Marking failed.", id);
            match self.inner.registry.transition(&id, StreamState::Failed) {
                Ok(true) => self.emit(&id, StreamEventKind::Crashed),
                Ok(false) => {}
                Err(e) => error!("Crash transition rejected for [{}]: {}", id, e),
            }
        }
    }

    /// 空闲回收: 切片数量在窗口内没有增长的流被停止
    /// 守住监督进程崩溃重启后遗留的孤儿转码器
    pub async fn evict_stale(&self, max_idle: Duration) {
        let mut evict = Vec::new();
        for handle in self.inner.registry.snapshot_all() {
            if handle.state == StreamState::Starting {
                continue; // 就绪监视还在负责
            }
            let report = watcher::inspect(&handle.output_dir).await;
            if let Some(stalled) = self
                .inner
                .registry
                .note_progress(&handle.stream_id, report.segment_count)
            {
                if stalled > max_idle {
                    evict.push(handle.stream_id);
                }
            }
        }
        for id in evict {
            warn!("Stream [{}] static for over {:?}. Evicting.", id, max_idle);
            self.emit(&id, StreamEventKind::Evicted);
            self.stop_stream(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, StreamingConfig};
    use crate::probe::ConnectivityReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProber {
        reachable: bool,
        transport: Option<Transport>,
        reachability_calls: AtomicUsize,
        probe_calls: AtomicUsize,
    }

    impl FakeProber {
        fn new(reachable: bool, transport: Option<Transport>) -> Arc<Self> {
            Arc::new(Self {
                reachable,
                transport,
                reachability_calls: AtomicUsize::new(0),
                probe_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn test_reachability(&self, _host: &str, _port: u16) -> ConnectivityReport {
            self.reachability_calls.fetch_add(1, Ordering::SeqCst);
            ConnectivityReport {
                reachable: self.reachable,
                negotiated: None,
                latency_ms: 1,
                error_detail: if self.reachable {
                    None
                } else {
                    Some("connection refused".to_string())
                },
            }
        }

        async fn probe_stream(&self, _url: &str) -> Result<Transport, StreamError> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            self.transport.ok_or_else(|| StreamError::ProbeFailed {
                summary: "tcp: refused; udp: refused; auto: refused".to_string(),
            })
        }
    }

    fn test_config(hls_root: &Path, ffmpeg: &str, ready_timeout_ms: u64) -> AppConfig {
        AppConfig {
            server: ServerConfig {
                listen: "127.0.0.1:0".to_string(),
                ffmpeg_binary: ffmpeg.to_string(),
                ffprobe_binary: "ffprobe".to_string(),
                hls_root: hls_root.to_string_lossy().into_owned(),
                monitor_interval_ms: 100,
            },
            streaming: StreamingConfig {
                ready_timeout_ms,
                ready_poll_ms: 50,
                stop_grace_ms: 1000,
                ..StreamingConfig::default()
            },
        }
    }

    async fn wait_until<F: Fn() -> bool>(timeout_ms: u64, predicate: F) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if predicate() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn malformed_url_fails_validation_before_any_io() {
        let tmp = tempfile::tempdir().unwrap();
        let prober = FakeProber::new(true, Some(Transport::Tcp));
        let supervisor = StreamSupervisor::new(
            test_config(tmp.path(), "/nonexistent/ffmpeg", 500),
            prober.clone(),
        );

        let err = supervisor
            .start_stream("http://10.0.0.5/ch1", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidUrl { .. }));

        // 没有触达预检, 没有句柄, 没有进程
        assert_eq!(prober.reachability_calls.load(Ordering::SeqCst), 0);
        assert_eq!(prober.probe_calls.load(Ordering::SeqCst), 0);
        assert!(supervisor.get_stats().stream_ids.is_empty());
        assert!(supervisor.inner.engine.tracked_ids().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_fails_fast_without_starting_the_engine() {
        let tmp = tempfile::tempdir().unwrap();
        let prober = FakeProber::new(false, None);
        let supervisor = StreamSupervisor::new(
            test_config(tmp.path(), "/nonexistent/ffmpeg", 500),
            prober.clone(),
        );

        let err = supervisor
            .start_stream("rtsp://10.0.0.5:554/ch1", StartOptions::default())
            .await
            .unwrap_err();
        match err {
            StreamError::Unreachable { host, port, .. } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(port, 554);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(prober.reachability_calls.load(Ordering::SeqCst), 1);
        assert_eq!(prober.probe_calls.load(Ordering::SeqCst), 0);
        assert!(supervisor.get_stats().stream_ids.is_empty());
        assert!(supervisor.inner.engine.tracked_ids().is_empty());
    }

    #[tokio::test]
    async fn stop_on_unknown_id_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = StreamSupervisor::new(
            test_config(tmp.path(), "/nonexistent/ffmpeg", 500),
            FakeProber::new(true, Some(Transport::Tcp)),
        );
        supervisor.stop_stream("no-such-stream");
        assert!(supervisor.get_stats().stream_ids.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_rolls_back_the_registration() {
        let tmp = tempfile::tempdir().unwrap();
        let supervisor = StreamSupervisor::new(
            test_config(tmp.path(), "/nonexistent/ffmpeg", 500),
            FakeProber::new(true, Some(Transport::Tcp)),
        );
        let err = supervisor
            .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::Spawn(_)));
        assert!(supervisor.get_stats().stream_ids.is_empty());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// 模拟 1 秒内写出可播放列表的转码器 (最后一个参数是播放列表路径)
        const READY_STUB: &str = r#"#!/bin/sh
for last; do :; done
d="$(dirname "$last")"
mkdir -p "$d"
printf '#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nseg000.ts\n' > "$last"
touch "$d/seg000.ts"
exec sleep 30
"#;

        /// 模拟永远不产出播放列表的转码器
        const SILENT_STUB: &str = "#!/bin/sh\nexec sleep 30\n";

        /// 模拟持续产出新切片的转码器
        const GROWING_STUB: &str = r#"#!/bin/sh
for last; do :; done
d="$(dirname "$last")"
mkdir -p "$d"
printf '#EXTM3U\n#EXTINF:2.0,\nseg000.ts\n' > "$last"
i=0
while [ "$i" -lt 100 ]; do
  touch "$d/seg$i.ts"
  i=$((i+1))
  sleep 0.2
done
"#;

        fn write_stub(dir: &Path, name: &str, body: &str) -> String {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[tokio::test]
        async fn ready_transcoder_reaches_running_and_counts_as_active() {
            let tmp = tempfile::tempdir().unwrap();
            let stub = write_stub(tmp.path(), "ready.sh", READY_STUB);
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );

            let before = supervisor.get_stats().active_count;
            let started = supervisor
                .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
                .await
                .unwrap();
            assert_eq!(
                started.hls_url,
                format!("/hls/{}/playlist.m3u8", started.stream_id)
            );

            let id = started.stream_id.clone();
            assert!(wait_until(5000, || supervisor.is_active(&id)).await);
            assert_eq!(supervisor.get_stats().active_count, before + 1);

            let report = supervisor.check_readiness(&id).await.unwrap();
            assert!(report.exists);
            assert!(report.segment_count >= 1);

            supervisor.stop_stream(&id);
        }

        #[tokio::test]
        async fn forced_start_never_touches_the_prober() {
            let tmp = tempfile::tempdir().unwrap();
            let stub = write_stub(tmp.path(), "ready.sh", READY_STUB);
            // 预检必败的假探测器: 只要被调用, 流就起不来
            let prober = FakeProber::new(false, None);
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 5000),
                prober.clone(),
            );

            let started = supervisor
                .start_stream(
                    "rtsp://10.0.0.9/ch1",
                    StartOptions {
                        forced: true,
                        stream_id: None,
                    },
                )
                .await
                .unwrap();

            let id = started.stream_id.clone();
            assert!(wait_until(5000, || supervisor.is_active(&id)).await);
            assert_eq!(prober.reachability_calls.load(Ordering::SeqCst), 0);
            assert_eq!(prober.probe_calls.load(Ordering::SeqCst), 0);
            assert!(supervisor.inner.registry.get(&id).unwrap().forced);

            supervisor.stop_stream(&id);
        }

        #[tokio::test]
        async fn stop_deactivates_immediately_even_before_teardown_finishes() {
            let tmp = tempfile::tempdir().unwrap();
            let stub = write_stub(tmp.path(), "ready.sh", READY_STUB);
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );

            let started = supervisor
                .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
                .await
                .unwrap();
            let id = started.stream_id.clone();
            assert!(wait_until(5000, || supervisor.is_active(&id)).await);

            supervisor.stop_stream(&id);
            // 进程回收还在后台进行, 但注册表视角已经停止
            assert!(!supervisor.is_active(&id));
            assert!(!supervisor.contains(&id));

            let engine = &supervisor.inner.engine;
            assert!(wait_until(5000, || !engine.is_alive(&id)).await);
        }

        #[tokio::test]
        async fn silent_transcoder_fails_by_deadline_with_no_leaked_process() {
            let tmp = tempfile::tempdir().unwrap();
            let stub = write_stub(tmp.path(), "silent.sh", SILENT_STUB);
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 300),
                FakeProber::new(true, Some(Transport::Tcp)),
            );
            let mut events = supervisor.subscribe();

            let started = supervisor
                .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
                .await
                .unwrap();
            let id = started.stream_id.clone();

            let registry = &supervisor.inner.registry;
            assert!(
                wait_until(10_000, || {
                    registry
                        .get(&id)
                        .map(|h| h.state == StreamState::Failed)
                        .unwrap_or(false)
                })
                .await
            );

            // 恰好一次换协议重试: tcp 起步, 失败后记录的是 udp
            let handle = registry.get(&id).unwrap();
            assert_eq!(handle.transport, Transport::Udp);

            // 进程已被确认回收
            assert!(!supervisor.inner.engine.is_alive(&id));
            assert!(supervisor.inner.engine.tracked_ids().is_empty());

            let mut saw_timeout = false;
            while let Ok(event) = events.try_recv() {
                if event.stream_id == id && event.kind == StreamEventKind::ReadinessTimeout {
                    saw_timeout = true;
                }
            }
            assert!(saw_timeout);
        }

        #[tokio::test]
        async fn concurrent_starts_with_the_same_id_race_to_one_winner() {
            let tmp = tempfile::tempdir().unwrap();
            let stub = write_stub(tmp.path(), "ready.sh", READY_STUB);
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );

            let opts = || StartOptions {
                forced: true,
                stream_id: Some("cam-7".to_string()),
            };
            let (first, second) = tokio::join!(
                supervisor.start_stream("rtsp://10.0.0.5/ch1", opts()),
                supervisor.start_stream("rtsp://10.0.0.5/ch1", opts()),
            );

            let outcomes = [first, second];
            assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
            let loser = outcomes.iter().find(|r| r.is_err()).unwrap();
            assert!(matches!(
                loser.as_ref().unwrap_err(),
                StreamError::DuplicateStream(id) if id == "cam-7"
            ));
            assert_eq!(supervisor.get_stats().stream_ids, vec!["cam-7"]);

            supervisor.stop_stream("cam-7");
        }

        #[tokio::test]
        async fn crashed_transcoder_is_marked_failed_by_the_health_sweep() {
            let tmp = tempfile::tempdir().unwrap();
            // 写出播放列表后很快退出
            let stub = write_stub(
                tmp.path(),
                "flaky.sh",
                r#"#!/bin/sh
for last; do :; done
d="$(dirname "$last")"
mkdir -p "$d"
printf '#EXTM3U\n#EXTINF:2.0,\nseg000.ts\n' > "$last"
touch "$d/seg000.ts"
exec sleep 1
"#,
            );
            let supervisor = StreamSupervisor::new(
                test_config(&tmp.path().join("hls"), &stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );
            let mut events = supervisor.subscribe();

            let started = supervisor
                .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
                .await
                .unwrap();
            let id = started.stream_id.clone();
            assert!(wait_until(5000, || supervisor.is_active(&id)).await);

            // 等进程自行退出, 再手动驱动一轮扫描 (测试不起后台循环)
            let engine = &supervisor.inner.engine;
            assert!(wait_until(5000, || !engine.is_alive(&id)).await);
            supervisor.health_sweep().await;

            let handle = supervisor.inner.registry.get(&id).unwrap();
            assert_eq!(handle.state, StreamState::Failed);

            let mut saw_crash = false;
            while let Ok(event) = events.try_recv() {
                if event.stream_id == id && event.kind == StreamEventKind::Crashed {
                    saw_crash = true;
                }
            }
            assert!(saw_crash);
        }

        #[tokio::test]
        async fn evict_stale_removes_static_streams_and_keeps_growing_ones() {
            let tmp = tempfile::tempdir().unwrap();
            let static_stub = write_stub(tmp.path(), "static.sh", READY_STUB);
            let growing_stub = write_stub(tmp.path(), "growing.sh", GROWING_STUB);

            let static_sup = StreamSupervisor::new(
                test_config(&tmp.path().join("hls-a"), &static_stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );
            let growing_sup = StreamSupervisor::new(
                test_config(&tmp.path().join("hls-b"), &growing_stub, 5000),
                FakeProber::new(true, Some(Transport::Tcp)),
            );

            let static_id = static_sup
                .start_stream("rtsp://10.0.0.5/ch1", StartOptions::default())
                .await
                .unwrap()
                .stream_id;
            let growing_id = growing_sup
                .start_stream("rtsp://10.0.0.6/ch1", StartOptions::default())
                .await
                .unwrap()
                .stream_id;

            assert!(wait_until(5000, || static_sup.is_active(&static_id)).await);
            assert!(wait_until(5000, || growing_sup.is_active(&growing_id)).await);

            let window = Duration::from_millis(600);
            // 第一轮扫描建立切片数量基线
            static_sup.evict_stale(window).await;
            growing_sup.evict_stale(window).await;
            tokio::time::sleep(Duration::from_millis(900)).await;
            static_sup.evict_stale(window).await;
            growing_sup.evict_stale(window).await;

            // 停滞的被回收, 持续增长的保留
            assert!(!static_sup.contains(&static_id));
            assert!(growing_sup.is_active(&growing_id));

            growing_sup.stop_stream(&growing_id);
        }
    }
}
