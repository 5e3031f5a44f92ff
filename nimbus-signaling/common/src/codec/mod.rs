//! 编解码
//!
//! 每种编码都是纯函数式的 `EnvelopeCodec`，解码结果用 `CodecOutcome` 区分
//! “解码成功 / 不是本协议 / 是本协议但内容损坏”，由 `CodecChain` 按配置的优先级依次尝试。

mod binary;
mod chain;
mod frame;
mod json;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

pub use binary::{BinaryCodec, ProtoEnvelope};
pub use chain::CodecChain;
pub use frame::{DEFAULT_MAX_FRAME_BYTES, length_delimited};
pub use json::JsonCodec;

use crate::error::{SignalingError, SignalingResult};
use crate::models::Envelope;

/// 线上编码协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// 带标签的二进制 schema（prost）
    Proto,
    Json,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Proto => "proto",
            Protocol::Json => "json",
        }
    }

    pub fn other(self) -> Protocol {
        match self {
            Protocol::Proto => Protocol::Json,
            Protocol::Json => Protocol::Proto,
        }
    }
}

impl FromStr for Protocol {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proto" | "protobuf" | "binary" => Ok(Protocol::Proto),
            "json" => Ok(Protocol::Json),
            other => Err(SignalingError::InvalidParameter(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次解码尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CodecOutcome {
    Decoded(Envelope),
    /// 不是本协议的帧，可交给下一个编解码器
    Mismatch,
    /// 看起来是本协议，但解析失败
    Error(String),
}

impl CodecOutcome {
    pub fn into_envelope(self) -> Option<Envelope> {
        match self {
            CodecOutcome::Decoded(env) => Some(env),
            _ => None,
        }
    }
}

/// Envelope 编解码器
pub trait EnvelopeCodec: Send + Sync {
    fn protocol(&self) -> Protocol;

    fn decode(&self, frame: &[u8]) -> CodecOutcome;

    fn encode(&self, envelope: &Envelope) -> SignalingResult<Bytes>;
}

/// 按协议取编解码器
pub fn codec_for(protocol: Protocol) -> Box<dyn EnvelopeCodec> {
    match protocol {
        Protocol::Proto => Box::new(BinaryCodec),
        Protocol::Json => Box::new(JsonCodec),
    }
}
