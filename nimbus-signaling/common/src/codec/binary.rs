use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use super::{CodecOutcome, EnvelopeCodec, Protocol};
use crate::error::{SignalingError, SignalingResult};
use crate::models::Envelope;

/// Envelope 的二进制 schema
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoEnvelope {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub token: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub request_id: ::prost::alloc::string::String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(string, tag = "5")]
    pub client_ip: ::prost::alloc::string::String,
    #[prost(string, tag = "6")]
    pub user_agent: ::prost::alloc::string::String,
    #[prost(string, tag = "7")]
    pub device_type: ::prost::alloc::string::String,
    #[prost(map = "string, string", tag = "8")]
    pub metadata: HashMap<::prost::alloc::string::String, ::prost::alloc::string::String>,
    /// JSON 编码的业务载荷
    #[prost(bytes = "vec", tag = "9")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, repeated, tag = "10")]
    pub ids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "11")]
    pub message: ::prost::alloc::string::String,
}

impl TryFrom<&Envelope> for ProtoEnvelope {
    type Error = SignalingError;

    fn try_from(env: &Envelope) -> Result<Self, Self::Error> {
        let data = match &env.data {
            Some(value) => serde_json::to_vec(value)?,
            None => Vec::new(),
        };
        Ok(Self {
            code: env.code,
            token: env.token.clone().unwrap_or_default(),
            request_id: env.request_id.clone().unwrap_or_default(),
            timestamp: env.timestamp,
            client_ip: env.client_ip.clone().unwrap_or_default(),
            user_agent: env.user_agent.clone().unwrap_or_default(),
            device_type: env.device_type.clone().unwrap_or_default(),
            metadata: env.metadata.clone(),
            data,
            ids: env.ids.clone(),
            message: env.message.clone().unwrap_or_default(),
        })
    }
}

impl TryFrom<ProtoEnvelope> for Envelope {
    type Error = SignalingError;

    fn try_from(proto: ProtoEnvelope) -> Result<Self, Self::Error> {
        let data = if proto.data.is_empty() {
            None
        } else {
            Some(serde_json::from_slice(&proto.data)?)
        };
        let envelope = Envelope {
            code: proto.code,
            token: Some(proto.token),
            request_id: Some(proto.request_id),
            timestamp: proto.timestamp,
            client_ip: Some(proto.client_ip),
            user_agent: Some(proto.user_agent),
            device_type: Some(proto.device_type),
            metadata: proto.metadata,
            data,
            ids: proto.ids,
            message: Some(proto.message),
        };
        Ok(envelope.normalized())
    }
}

/// 二进制编码（prost）
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl EnvelopeCodec for BinaryCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Proto
    }

    fn decode(&self, frame: &[u8]) -> CodecOutcome {
        match frame.first() {
            None => return CodecOutcome::Error("empty frame".to_string()),
            // 0x7b 对应 field 15 / start-group，本 schema 不会产生
            Some(b'{') => return CodecOutcome::Mismatch,
            Some(_) => {}
        }
        let proto = match ProtoEnvelope::decode(frame) {
            Ok(proto) => proto,
            Err(err) => return CodecOutcome::Error(err.to_string()),
        };
        match Envelope::try_from(proto) {
            Ok(envelope) => CodecOutcome::Decoded(envelope),
            Err(err) => CodecOutcome::Error(err.to_string()),
        }
    }

    fn encode(&self, envelope: &Envelope) -> SignalingResult<Bytes> {
        let proto = ProtoEnvelope::try_from(envelope)?;
        Ok(Bytes::from(proto.encode_to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageType;

    #[test]
    fn json_object_is_mismatch() {
        assert_eq!(
            BinaryCodec.decode(br#"{"code":1000}"#),
            CodecOutcome::Mismatch
        );
    }

    #[test]
    fn truncated_frame_is_error() {
        let env = Envelope::builder(MessageType::Login).token("abc").build();
        let bytes = BinaryCodec.encode(&env).unwrap();
        let outcome = BinaryCodec.decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(outcome, CodecOutcome::Error(_)));
        assert!(matches!(BinaryCodec.decode(b""), CodecOutcome::Error(_)));
    }

    #[test]
    fn invalid_json_payload_is_error() {
        let proto = ProtoEnvelope {
            code: 2000,
            data: b"not json".to_vec(),
            ..ProtoEnvelope::default()
        };
        let outcome = BinaryCodec.decode(&proto.encode_to_vec());
        assert!(matches!(outcome, CodecOutcome::Error(_)));
    }
}
