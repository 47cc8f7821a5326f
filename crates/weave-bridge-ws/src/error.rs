use thiserror::Error;
use weave_core::CoreError;

/// 线上错误码，随 Error 信封发给对端；一经发布不得变更字面值。
pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const VERSION_MISMATCH: &str = "version_mismatch";
    pub const INVALID_FORMAT: &str = "invalid_format";
    pub const INTERNAL: &str = "internal";
}

/// 桥本地的错误域。
///
/// 传播策略：连接内的错误只关闭该连接，不影响其它连接；
/// 对端收到的内部错误只携带泛化描述，完整原因落在服务端日志。
#[derive(Debug, Error)]
pub enum BridgeError {
    /// 握手或信封违例。
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Hello 宣告了不支持的协议版本。
    #[error("unsupported protocol version {actual}, expected {expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// 握手、广播或优雅关闭超出时限。
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// 编解码失败。
    #[error("codec failure: {0}")]
    Codec(String),

    /// 底层套接字失败。
    #[error("transport failure: {0}")]
    Transport(String),

    /// 收到的序号出现缺口，需要重同步。
    #[error("sequence gap detected, resync required")]
    SequenceGap,

    /// 核心引擎错误。
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl BridgeError {
    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }
}
