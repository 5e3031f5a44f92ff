//! 长度前缀分帧（4 字节大端）

use tokio_util::codec::LengthDelimitedCodec;

/// 默认单帧上限 10 MiB
pub const DEFAULT_MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// 构建 4 字节大端长度前缀的分帧编解码器
pub fn length_delimited(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn reassembles_split_frames() {
        let mut codec = length_delimited(DEFAULT_MAX_FRAME_BYTES);
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);

        let mut partial = BytesMut::from(&wire[..6]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[6..]);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = length_delimited(8);
        let mut wire = BytesMut::new();
        wire.put_u32(64);
        wire.extend_from_slice(&[0u8; 64]);
        assert!(codec.decode(&mut wire).is_err());
    }
}
