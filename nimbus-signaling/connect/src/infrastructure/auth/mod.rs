//! 认证模块
//!
//! 提供 JWT 令牌校验

mod jwt;

pub use jwt::{JwtTokenService, TokenClaims};
