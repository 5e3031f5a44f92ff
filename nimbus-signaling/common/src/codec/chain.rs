use tracing::debug;

use super::{BinaryCodec, CodecOutcome, EnvelopeCodec, JsonCodec, Protocol};
use crate::models::Envelope;

/// 按优先级依次尝试的编解码链
///
/// 首选协议失败（不匹配或解析出错）时回退到另一协议，两类客户端可共用同一端口。
pub struct CodecChain {
    codecs: Vec<Box<dyn EnvelopeCodec>>,
}

impl CodecChain {
    pub fn new(primary: Protocol) -> Self {
        let codecs: Vec<Box<dyn EnvelopeCodec>> = match primary {
            Protocol::Proto => vec![Box::new(BinaryCodec), Box::new(JsonCodec)],
            Protocol::Json => vec![Box::new(JsonCodec), Box::new(BinaryCodec)],
        };
        Self { codecs }
    }

    pub fn primary(&self) -> Protocol {
        self.codecs
            .first()
            .map(|c| c.protocol())
            .unwrap_or(Protocol::Proto)
    }

    /// 依次尝试解码，返回成功的协议与结果
    ///
    /// 全部失败时：若有任何一个编解码器认领了该帧（Error），返回最先的错误，否则返回 Mismatch
    pub fn decode(&self, frame: &[u8]) -> (Option<Protocol>, CodecOutcome) {
        let mut first_error = None;
        for codec in &self.codecs {
            match codec.decode(frame) {
                CodecOutcome::Decoded(envelope) => {
                    return (Some(codec.protocol()), CodecOutcome::Decoded(envelope));
                }
                CodecOutcome::Mismatch => {
                    debug!(protocol = %codec.protocol(), "frame is not this protocol, trying next codec");
                }
                CodecOutcome::Error(reason) => {
                    debug!(protocol = %codec.protocol(), %reason, "codec failed, trying next codec");
                    if first_error.is_none() {
                        first_error = Some(reason);
                    }
                }
            }
        }
        match first_error {
            Some(reason) => (None, CodecOutcome::Error(reason)),
            None => (None, CodecOutcome::Mismatch),
        }
    }

    /// 只关心结果的便捷方法
    pub fn decode_envelope(&self, frame: &[u8]) -> Option<Envelope> {
        self.decode(frame).1.into_envelope()
    }
}
