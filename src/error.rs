/// 流管理的分类错误
///
/// 分类决定调用方的处理策略:
/// - `InvalidUrl` 在任何 I/O 之前同步返回, 调用方可修正后重试
/// - `Unreachable` / `ProbeFailed` 是同步预检失败, 强制模式可绕过
/// - `Spawn` 对本次启动是致命的, 不做自动重试
/// - `ReadinessTimeout` 在换传输协议重试一次之后才会出现
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid rtsp url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("camera {host}:{port} unreachable: {detail}")]
    Unreachable {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("rtsp probe failed on all transports: {summary}")]
    ProbeFailed { summary: String },

    #[error("stream [{0}] already exists")]
    DuplicateStream(String),

    #[error("failed to launch transcoder: {0}")]
    Spawn(String),

    #[error("stream [{stream_id}] produced no playable output within {waited_ms}ms")]
    ReadinessTimeout { stream_id: String, waited_ms: u64 },

    /// 注册表状态被破坏, 必须大声失败而不是静默降级
    #[error("stream registry invariant violated: {0}")]
    InvariantViolation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;
