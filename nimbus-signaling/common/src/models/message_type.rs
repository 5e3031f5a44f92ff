//! 消息类型（Envelope.code）

use std::fmt;

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    /// 登录
    Login = 1000,
    LoginSuccess = 1001,
    /// 心跳
    HeartBeat = 1002,
    HeartBeatSuccess = 1003,
    /// 令牌即将过期，提示客户端刷新
    RefreshToken = 1004,
    /// 被挤下线 / 强制下线
    ForceLogout = 1005,
    /// 客户端主动登出
    Logout = 1006,

    SingleMessage = 2000,
    GroupMessage = 2001,
    VideoMessage = 2002,
    GroupOperation = 2003,
    /// 撤回、编辑等消息操作
    MessageOperation = 2004,

    NotLoggedIn = 4001,
    TokenExpired = 4002,
    TokenMalformed = 4003,
    ConnectionLimited = 4029,
    RateLimited = 4030,
}

impl MessageType {
    pub fn from_code(code: i32) -> Option<Self> {
        let kind = match code {
            1000 => MessageType::Login,
            1001 => MessageType::LoginSuccess,
            1002 => MessageType::HeartBeat,
            1003 => MessageType::HeartBeatSuccess,
            1004 => MessageType::RefreshToken,
            1005 => MessageType::ForceLogout,
            1006 => MessageType::Logout,
            2000 => MessageType::SingleMessage,
            2001 => MessageType::GroupMessage,
            2002 => MessageType::VideoMessage,
            2003 => MessageType::GroupOperation,
            2004 => MessageType::MessageOperation,
            4001 => MessageType::NotLoggedIn,
            4002 => MessageType::TokenExpired,
            4003 => MessageType::TokenMalformed,
            4029 => MessageType::ConnectionLimited,
            4030 => MessageType::RateLimited,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Login => "LOGIN",
            MessageType::LoginSuccess => "LOGIN_SUCCESS",
            MessageType::HeartBeat => "HEART_BEAT",
            MessageType::HeartBeatSuccess => "HEART_BEAT_SUCCESS",
            MessageType::RefreshToken => "REFRESH_TOKEN",
            MessageType::ForceLogout => "FORCE_LOGOUT",
            MessageType::Logout => "LOGOUT",
            MessageType::SingleMessage => "SINGLE_MESSAGE",
            MessageType::GroupMessage => "GROUP_MESSAGE",
            MessageType::VideoMessage => "VIDEO_MESSAGE",
            MessageType::GroupOperation => "GROUP_OPERATION",
            MessageType::MessageOperation => "MESSAGE_OPERATION",
            MessageType::NotLoggedIn => "NOT_LOGGED_IN",
            MessageType::TokenExpired => "TOKEN_EXPIRED",
            MessageType::TokenMalformed => "TOKEN_MALFORMED",
            MessageType::ConnectionLimited => "CONNECTION_LIMITED",
            MessageType::RateLimited => "RATE_LIMITED",
        }
    }

    /// 客户端上行的业务消息（需要登录、受限流约束）
    pub fn is_business(self) -> bool {
        matches!(
            self,
            MessageType::SingleMessage
                | MessageType::GroupMessage
                | MessageType::VideoMessage
                | MessageType::GroupOperation
                | MessageType::MessageOperation
        )
    }
}

impl TryFrom<i32> for MessageType {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        MessageType::from_code(code).ok_or(code)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(MessageType::Login.code(), 1000);
        assert_eq!(MessageType::ForceLogout.code(), 1005);
        assert_eq!(MessageType::from_code(2001), Some(MessageType::GroupMessage));
        assert_eq!(MessageType::try_from(4030), Ok(MessageType::RateLimited));
        assert_eq!(MessageType::try_from(42), Err(42));
    }

    #[test]
    fn business_kinds() {
        assert!(MessageType::SingleMessage.is_business());
        assert!(MessageType::MessageOperation.is_business());
        assert!(!MessageType::HeartBeat.is_business());
        assert!(!MessageType::ForceLogout.is_business());
    }
}
