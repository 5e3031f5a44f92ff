//! 信令服务错误类型定义

use nimbus_im_core::error::{ErrorBuilder, ErrorCode, NimbusError};
use thiserror::Error;

/// 信令服务错误类型
#[derive(Debug, Error)]
pub enum SignalingError {
    /// 编解码失败
    #[error("Codec error: {0}")]
    Codec(String),

    /// 帧超过上限
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 未知消息类型
    #[error("Unknown message code: {0}")]
    UnknownCode(i32),

    /// 无效的参数
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),

    /// 其他错误
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 信令服务结果类型
pub type SignalingResult<T> = Result<T, SignalingError>;

impl From<SignalingError> for NimbusError {
    fn from(err: SignalingError) -> Self {
        let code = match &err {
            SignalingError::Codec(_) | SignalingError::FrameTooLarge { .. } => {
                ErrorCode::SerializationFailed
            }
            SignalingError::UnknownCode(_) | SignalingError::InvalidParameter(_) => {
                ErrorCode::InvalidParameter
            }
            SignalingError::Internal(_) | SignalingError::Other(_) => ErrorCode::InternalError,
        };
        ErrorBuilder::new(code, "signaling error")
            .details(err.to_string())
            .build_error()
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Codec(err.to_string())
    }
}

impl From<prost::DecodeError> for SignalingError {
    fn from(err: prost::DecodeError) -> Self {
        SignalingError::Codec(err.to_string())
    }
}
