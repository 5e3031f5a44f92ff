//! Nimbus IM Core 错误工具模块
//!
//! - 统一的错误码 `ErrorCode` 与错误类型 `NimbusError`
//! - 为基础设施层提供便捷的错误转换工具

use std::fmt;

use thiserror::Error;

/// 错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidParameter,
    Unauthenticated,
    TokenExpired,
    TokenInvalid,
    NotFound,
    ConnectionLimited,
    RateLimited,
    ServiceUnavailable,
    Timeout,
    SerializationFailed,
    ConfigurationError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::TokenInvalid => "TOKEN_INVALID",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ConnectionLimited => "CONNECTION_LIMITED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::SerializationFailed => "SERIALIZATION_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// 基础设施类错误（可重试，不应暴露给客户端）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ErrorCode::ServiceUnavailable | ErrorCode::Timeout | ErrorCode::InternalError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 统一业务错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{code}] {message}{}", .details.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct NimbusError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl NimbusError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

pub type Result<T> = std::result::Result<T, NimbusError>;

/// 错误构建器
pub struct ErrorBuilder {
    code: ErrorCode,
    message: String,
    details: Option<String>,
}

impl ErrorBuilder {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn build_error(self) -> NimbusError {
        NimbusError {
            code: self.code,
            message: self.message,
            details: self.details,
        }
    }
}

/// 将基础设施错误映射为业务错误
pub fn map_infra_error<E: fmt::Display>(err: E, code: ErrorCode, message: &str) -> NimbusError {
    ErrorBuilder::new(code, message)
        .details(err.to_string())
        .build_error()
}

/// 基础设施结果扩展
pub trait InfraResultExt<T> {
    fn into_nimbus(self, code: ErrorCode, message: &str) -> Result<T>;
}

impl<T, E: fmt::Display> InfraResultExt<T> for std::result::Result<T, E> {
    fn into_nimbus(self, code: ErrorCode, message: &str) -> Result<T> {
        self.map_err(|err| map_infra_error(err, code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_details() {
        let err = ErrorBuilder::new(ErrorCode::ServiceUnavailable, "redis unreachable")
            .details("connection refused")
            .build_error();
        assert_eq!(
            err.to_string(),
            "[SERVICE_UNAVAILABLE] redis unreachable: connection refused"
        );
        assert!(err.code().is_infrastructure());
    }

    #[test]
    fn foreign_errors_map_into_nimbus_errors() {
        fn parse(input: &str) -> Result<u16> {
            input
                .parse::<u16>()
                .into_nimbus(ErrorCode::InvalidParameter, "invalid port")
        }

        assert_eq!(parse("8080"), Ok(8080));
        let err = parse("not-a-port").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
        assert_eq!(err.message, "invalid port");
        assert!(err.details.is_some());
    }
}
