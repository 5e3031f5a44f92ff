//! 鉴权闸门
//!
//! 连接上的第一个单元必须携带有效凭证。WebSocket 在 HTTP 升级握手时校验，
//! TCP 在第一帧校验。闸门本身无共享可变状态，认证结果写入连接一次后不再变化。

use std::collections::HashMap;
use std::sync::Arc;

use nimbus_im_core::metrics::ConnectMetrics;
use nimbus_signaling_common::codec::{CodecChain, CodecOutcome, Protocol};
use nimbus_signaling_common::Envelope;
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::domain::model::ConnectionIdentity;
use crate::domain::repository::{AuthFailure, IdentityValidator};

/// 握手阶段提取出的凭证
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeCredentials {
    pub token: Option<String>,
    pub device_type: Option<String>,
}

impl HandshakeCredentials {
    /// 令牌依次取自查询参数 `token`、`Authorization: Bearer`、Cookie `token`；
    /// 设备类型取自查询参数 `deviceType`，其次 `X-Device-Type` 头。
    /// 查询参数与 Cookie 值均按 URL 编码解码。
    pub fn extract(query: Option<&str>, header: impl Fn(&str) -> Option<String>) -> Self {
        let params: HashMap<String, String> =
            form_urlencoded::parse(query.unwrap_or_default().as_bytes())
                .into_owned()
                .collect();

        let token = params
            .get("token")
            .cloned()
            .or_else(|| {
                header("authorization").and_then(|value| {
                    value
                        .strip_prefix("Bearer ")
                        .or_else(|| value.strip_prefix("bearer "))
                        .map(|t| t.trim().to_string())
                })
            })
            .or_else(|| header("cookie").and_then(|cookies| cookie_value(&cookies, "token")))
            .filter(|t| !t.is_empty());

        let device_type = params
            .get("deviceType")
            .cloned()
            .or_else(|| header("x-device-type"))
            .filter(|d| !d.is_empty());

        Self { token, device_type }
    }
}

/// 首帧认证成功
#[derive(Debug)]
pub struct AuthenticatedFrame {
    pub identity: ConnectionIdentity,
    /// 首帧本身是 Envelope 时继续向下游处理
    pub envelope: Option<Envelope>,
    pub protocol: Option<Protocol>,
}

/// 首帧认证失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRejection {
    pub failure: AuthFailure,
    /// 用于编码拒绝回复
    pub protocol: Option<Protocol>,
}

pub struct AuthGate {
    validator: Arc<dyn IdentityValidator>,
    chain: CodecChain,
    metrics: Arc<ConnectMetrics>,
}

impl AuthGate {
    pub fn new(
        validator: Arc<dyn IdentityValidator>,
        primary: Protocol,
        metrics: Arc<ConnectMetrics>,
    ) -> Self {
        Self {
            validator,
            chain: CodecChain::new(primary),
            metrics,
        }
    }

    pub fn authenticate_handshake(
        &self,
        credentials: &HandshakeCredentials,
    ) -> Result<ConnectionIdentity, AuthFailure> {
        self.authenticate(credentials.token.as_deref(), credentials.device_type.clone())
    }

    /// 首帧认证：优先按 Envelope 解码，其次按 JSON 对象或 `key=value` 文本提取凭证
    pub fn authenticate_frame(&self, frame: &[u8]) -> Result<AuthenticatedFrame, GateRejection> {
        let (protocol, outcome) = self.chain.decode(frame);
        if let CodecOutcome::Decoded(envelope) = outcome {
            let token = envelope
                .token
                .clone()
                .or_else(|| envelope.data_str("token").map(str::to_string));
            if token.is_some() {
                let device_type = envelope.device_type.clone();
                return match self.authenticate(token.as_deref(), device_type) {
                    Ok(identity) => Ok(AuthenticatedFrame {
                        identity,
                        envelope: Some(envelope),
                        protocol,
                    }),
                    Err(failure) => Err(GateRejection { failure, protocol }),
                };
            }
        }

        let text_credentials = std::str::from_utf8(frame).ok().and_then(parse_text_credentials);
        let (credentials, protocol) = match text_credentials {
            Some((credentials, text_protocol)) => (credentials, text_protocol.or(protocol)),
            None => (HandshakeCredentials::default(), protocol),
        };
        match self.authenticate_handshake(&credentials) {
            Ok(identity) => Ok(AuthenticatedFrame {
                identity,
                envelope: None,
                protocol,
            }),
            Err(failure) => Err(GateRejection { failure, protocol }),
        }
    }

    /// 拒绝回复
    pub fn rejection(failure: AuthFailure) -> Envelope {
        Envelope::builder(failure.reply_kind())
            .message(failure.to_string())
            .build()
    }

    fn authenticate(
        &self,
        token: Option<&str>,
        device_type: Option<String>,
    ) -> Result<ConnectionIdentity, AuthFailure> {
        let result = match token.filter(|t| !t.is_empty()) {
            None => Err(AuthFailure::Missing),
            Some(token) => self
                .validator
                .validate(token)
                .map(|verified| ConnectionIdentity::new(verified.user_id, device_type, token)),
        };
        match &result {
            Ok(identity) => debug!(user_id = %identity.user_id, "Connection authenticated"),
            Err(failure) => {
                warn!(reason = failure.label(), "Connection rejected by auth gate");
                self.metrics
                    .auth_failures_total
                    .with_label_values(&[failure.label()])
                    .inc();
            }
        }
        result
    }
}

/// Cookie 值可带双引号，内容按 URL 编码解码
fn cookie_value(cookies: &str, name: &str) -> Option<String> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key.trim() != name {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        let encoded = format!("{name}={}", value.replace('&', "%26"));
        form_urlencoded::parse(encoded.as_bytes())
            .next()
            .map(|(_, decoded)| decoded.into_owned())
    })
}

/// `{"token": ..}` / `{"data": {"token": ..}}` 或 `token=..&deviceType=..`
fn parse_text_credentials(text: &str) -> Option<(HandshakeCredentials, Option<Protocol>)> {
    let text = text.trim();
    if text.starts_with('{') {
        let value: Value = serde_json::from_str(text).ok()?;
        let token = value
            .get("token")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/data/token").and_then(Value::as_str))
            .map(str::to_string);
        let device_type = value
            .get("deviceType")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Some((HandshakeCredentials { token, device_type }, Some(Protocol::Json)));
    }

    if !text.contains('=') {
        return None;
    }
    let pairs = text
        .split(['&', ';', '\n'])
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect::<HashMap<_, _>>();
    let token = pairs.get("token").map(|t| t.to_string());
    let device_type = pairs.get("deviceType").map(|d| d.to_string());
    Some((HandshakeCredentials { token, device_type }, None))
}
