use crate::error::StreamError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;

pub const RTSP_DEFAULT_PORT: u16 = 554;

/// RTSP 传输协议候选, 按可靠性优先排序依次尝试
/// Auto 表示不指定 -rtsp_transport, 交给 FFmpeg 自行协商
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Auto,
}

impl Transport {
    pub const CANDIDATES: [Transport; 3] = [Transport::Tcp, Transport::Udp, Transport::Auto];

    /// -rtsp_transport 参数值 (Auto 不传该参数)
    pub fn as_arg(self) -> Option<&'static str> {
        match self {
            Transport::Tcp => Some("tcp"),
            Transport::Udp => Some("udp"),
            Transport::Auto => None,
        }
    }

    /// 就绪超时后重试使用的下一个候选
    pub fn next_candidate(self) -> Option<Transport> {
        match self {
            Transport::Tcp => Some(Transport::Udp),
            Transport::Udp => Some(Transport::Auto),
            Transport::Auto => None,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
            Transport::Auto => write!(f, "auto"),
        }
    }
}

/// 校验通过的 RTSP 地址要素
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspTarget {
    pub host: String,
    pub port: u16,
}

/// 连通性检测报告
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivityReport {
    pub reachable: bool,
    /// 协商成功的传输协议, None 表示尚未协商或全部失败
    pub negotiated: Option<Transport>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// 纯格式校验: 协议必须是 rtsp 且主机非空, 不做任何 I/O
pub fn validate_format(raw: &str) -> Result<RtspTarget, StreamError> {
    let parsed = Url::parse(raw).map_err(|e| StreamError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if parsed.scheme() != "rtsp" {
        return Err(StreamError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme {:?}", parsed.scheme()),
        });
    }

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| StreamError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })?;

    Ok(RtspTarget {
        host: host.to_string(),
        port: parsed.port().unwrap_or(RTSP_DEFAULT_PORT),
    })
}

/// 连通性预检接口
///
/// 拆成 trait 是为了让上层在测试中注入假实现,
/// 生产实现是基于 ffprobe 的 [`FfprobeProber`]
#[async_trait]
pub trait Prober: Send + Sync {
    /// TCP 层探测摄像头是否可达
    async fn test_reachability(&self, host: &str, port: u16) -> ConnectivityReport;

    /// 依次尝试传输协议候选, 返回第一个协商成功的;
    /// 全部失败时返回带各候选失败详情的聚合错误
    async fn probe_stream(&self, url: &str) -> Result<Transport, StreamError>;
}

pub struct FfprobeProber {
    ffprobe_binary: String,
    reachability_timeout: Duration,
    probe_timeout: Duration,
}

impl FfprobeProber {
    pub fn new(
        ffprobe_binary: impl Into<String>,
        reachability_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            ffprobe_binary: ffprobe_binary.into(),
            reachability_timeout,
            probe_timeout,
        }
    }

    /// 单个传输协议候选的元数据探测
    /// 无论成功/失败/超时, 都保证探测进程被回收
    async fn try_transport(&self, url: &str, transport: Transport) -> Result<(), String> {
        let mut cmd = Command::new(&self.ffprobe_binary);
        cmd.arg("-v").arg("quiet");
        if let Some(t) = transport.as_arg() {
            cmd.arg("-rtsp_transport").arg(t);
        }
        cmd.arg("-timeout")
            .arg((self.probe_timeout.as_micros() as u64).to_string())
            .arg("-i")
            .arg(url)
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("csv=p=0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("spawn ffprobe: {}", e))?;

        match tokio::time::timeout(self.probe_timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(format!("ffprobe exited with {}", status)),
            Ok(Err(e)) => Err(format!("wait ffprobe: {}", e)),
            Err(_) => {
                // 超时也必须回收探测进程
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(format!(
                    "ffprobe timed out after {}ms",
                    self.probe_timeout.as_millis()
                ))
            }
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn test_reachability(&self, host: &str, port: u16) -> ConnectivityReport {
        let begin = Instant::now();
        match tokio::time::timeout(self.reachability_timeout, TcpStream::connect((host, port)))
            .await
        {
            Ok(Ok(_)) => {
                let latency_ms = begin.elapsed().as_millis() as u64;
                info!("Network connection successful to {}:{} ({}ms)", host, port, latency_ms);
                ConnectivityReport {
                    reachable: true,
                    negotiated: None,
                    latency_ms,
                    error_detail: None,
                }
            }
            Ok(Err(e)) => {
                warn!("Network connection failed to {}:{}: {}", host, port, e);
                ConnectivityReport {
                    reachable: false,
                    negotiated: None,
                    latency_ms: begin.elapsed().as_millis() as u64,
                    error_detail: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!("Network connection to {}:{} timed out", host, port);
                ConnectivityReport {
                    reachable: false,
                    negotiated: None,
                    latency_ms: begin.elapsed().as_millis() as u64,
                    error_detail: Some(format!(
                        "connect timed out after {}ms",
                        self.reachability_timeout.as_millis()
                    )),
                }
            }
        }
    }

    async fn probe_stream(&self, url: &str) -> Result<Transport, StreamError> {
        let mut failures = Vec::new();
        for transport in Transport::CANDIDATES {
            match self.try_transport(url, transport).await {
                Ok(()) => {
                    info!("RTSP probe succeeded with {} transport", transport);
                    return Ok(transport);
                }
                Err(detail) => {
                    warn!("RTSP probe failed with {} transport: {}", transport, detail);
                    failures.push(format!("{}: {}", transport, detail));
                }
            }
        }
        Err(StreamError::ProbeFailed {
            summary: failures.join("; "),
        })
    }
}
