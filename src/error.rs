//! 管线错误类型
//! Pipeline error taxonomy

use thiserror::Error;

/// 管线错误
///
/// 客户端断开不是错误: 会话自然结束 (`Delivery::Closed` / 流被丢弃)。
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 有限视频源已读完 (文件结束)
    #[error("视频源已结束")]
    SourceExhausted,

    /// 视频源无法打开 (设备不存在 / 上游不可达 / 未知上游管线)
    #[error("视频源不可用: {0}")]
    SourceUnavailable(String),

    /// 单次读取失败, 下一次读取会重试
    #[error("读取帧失败: {0}")]
    TransientRead(String),

    /// 单个模型单帧推理失败
    #[error("模型 {model} 推理失败: {message}")]
    InferenceFailure { model: String, message: String },

    /// 配置校验失败, 原配置保持不变
    #[error("配置被拒绝: {0}")]
    ConfigRejected(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("线程启动失败: {0}")]
    Spawn(String),
}

impl PipelineError {
    /// 错误类别 (用于 HTTP 响应)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceExhausted => "source_exhausted",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::TransientRead(_) => "transient_read",
            Self::InferenceFailure { .. } => "inference_failure",
            Self::ConfigRejected(_) => "config_rejected",
            Self::NotFound(_) => "not_found",
            Self::Spawn(_) => "spawn",
        }
    }

    pub(crate) fn rejected(msg: impl Into<String>) -> Self {
        Self::ConfigRejected(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
