use bytes::Bytes;

use super::{CodecOutcome, EnvelopeCodec, Protocol};
use crate::error::SignalingResult;
use crate::models::Envelope;

/// JSON 文本编码
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn protocol(&self) -> Protocol {
        Protocol::Json
    }

    fn decode(&self, frame: &[u8]) -> CodecOutcome {
        let first = frame.iter().find(|b| !b.is_ascii_whitespace());
        if first != Some(&b'{') {
            return CodecOutcome::Mismatch;
        }
        match serde_json::from_slice::<Envelope>(frame) {
            Ok(envelope) => CodecOutcome::Decoded(envelope.normalized()),
            Err(err) => CodecOutcome::Error(err.to_string()),
        }
    }

    fn encode(&self, envelope: &Envelope) -> SignalingResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(envelope)?))
    }
}
