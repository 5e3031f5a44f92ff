use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use nimbus_im_core::error::{ErrorBuilder, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::repository::{AuthFailure, IdentityValidator, VerifiedToken};

/// Token Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// 用户ID
    pub sub: String,
    /// 过期时间（Unix时间戳，秒）
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// HS256 JWT 校验
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    /// 只用于读取过期时间，不校验 exp
    expiry_probe: Validation,
    issuer: Option<String>,
}

impl JwtTokenService {
    pub fn new(secret: &str, issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss.as_str()]);
        }

        let mut expiry_probe = validation.clone();
        expiry_probe.validate_exp = false;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry_probe,
            issuer,
        }
    }

    /// 签发令牌（运维工具与测试使用）
    pub fn issue(&self, user_id: &str, expires_at: DateTime<Utc>) -> Result<String> {
        let claims = TokenClaims {
            sub: user_id.to_string(),
            exp: expires_at.timestamp(),
            iat: Some(Utc::now().timestamp()),
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|err| {
            ErrorBuilder::new(ErrorCode::InternalError, "failed to sign token")
                .details(err.to_string())
                .build_error()
        })
    }

    /// 获取 token 预览（用于日志记录）
    fn token_preview(token: &str) -> String {
        match token.char_indices().nth(12) {
            Some((idx, _)) => format!("{}...", &token[..idx]),
            None => token.to_string(),
        }
    }
}

impl IdentityValidator for JwtTokenService {
    #[instrument(skip(self, token), fields(token_len = token.len()))]
    fn validate(&self, token: &str) -> std::result::Result<VerifiedToken, AuthFailure> {
        if token.trim().is_empty() {
            return Err(AuthFailure::Missing);
        }

        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(
            |err| {
                let failure = match err.kind() {
                    ErrorKind::ExpiredSignature => AuthFailure::Expired,
                    _ => AuthFailure::Malformed,
                };
                warn!(
                    token_preview = %Self::token_preview(token),
                    error = %err,
                    "Token validation failed"
                );
                failure
            },
        )?;

        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthFailure::Malformed);
        }
        debug!(user_id = %claims.sub, "Token validated");
        Ok(VerifiedToken {
            user_id: claims.sub,
            expires_at: DateTime::<Utc>::from_timestamp(claims.exp, 0),
        })
    }

    fn remaining_validity(&self, token: &str) -> Option<Duration> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.expiry_probe).ok()?;
        let remaining = data.claims.exp - Utc::now().timestamp();
        Some(Duration::from_secs(remaining.max(0) as u64))
    }
}
