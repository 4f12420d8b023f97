//! Frame codec.
//!
//! The connection reader only needs three things from a codec: the fixed
//! header size, a header decoder and a full-frame encoder. [`FrameCodec`]
//! captures that contract so applications can plug in their own wire format;
//! [`DataPack`] is the default binary layout.

use crate::message::Message;

/// Header size of the default [`DataPack`] layout in bytes.
pub const DATA_PACK_HEAD_LEN: usize = 14;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Fewer header bytes than the codec's fixed header length
    #[error("Header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort { expected: usize, actual: usize },

    /// Declared or actual payload larger than the configured maximum
    #[error("Packet of {size} bytes exceeds max packet size {limit}")]
    PacketTooLarge { size: u32, limit: u32 },
}

/// Wire format used by connections to frame messages.
///
/// The header length must be constant: the reader allocates and fills exactly
/// `head_len()` bytes before calling [`FrameCodec::unpack`].
pub trait FrameCodec: Send + Sync {
    /// Fixed header size in bytes.
    fn head_len(&self) -> usize;

    /// Decodes the header into a message carrying id, serial, error code and
    /// the declared body length. The body is attached by the caller.
    fn unpack(&self, head: &[u8]) -> Result<Message, CodecError>;

    /// Serializes header and payload into one frame ready for the socket.
    fn pack(&self, msg: &Message) -> Result<Vec<u8>, CodecError>;
}

/// Default little-endian frame layout.
///
/// ```text
/// +-----------+---------+---------+-----------+----------------+
/// | data_len  | msg_id  | serial  | err_code  | data ...       |
/// | u32       | u32     | u32     | u16       | data_len bytes |
/// +-----------+---------+---------+-----------+----------------+
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DataPack {
    /// Largest accepted payload; 0 disables the check
    max_packet_size: u32,
}

impl DataPack {
    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    fn check_size(&self, size: u32) -> Result<(), CodecError> {
        if self.max_packet_size > 0 && size > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size,
                limit: self.max_packet_size,
            });
        }
        Ok(())
    }
}

impl FrameCodec for DataPack {
    fn head_len(&self) -> usize {
        DATA_PACK_HEAD_LEN
    }

    fn unpack(&self, head: &[u8]) -> Result<Message, CodecError> {
        if head.len() < DATA_PACK_HEAD_LEN {
            return Err(CodecError::HeaderTooShort {
                expected: DATA_PACK_HEAD_LEN,
                actual: head.len(),
            });
        }

        let data_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        let id = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        let serial = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
        let err_code = u16::from_le_bytes([head[12], head[13]]);

        self.check_size(data_len)?;

        Ok(Message::from_header(id, serial, err_code, data_len))
    }

    fn pack(&self, msg: &Message) -> Result<Vec<u8>, CodecError> {
        self.check_size(msg.data_len())?;

        let mut buffer = Vec::with_capacity(DATA_PACK_HEAD_LEN + msg.data().len());
        buffer.extend_from_slice(&msg.data_len().to_le_bytes());
        buffer.extend_from_slice(&msg.id().to_le_bytes());
        buffer.extend_from_slice(&msg.serial().to_le_bytes());
        buffer.extend_from_slice(&msg.err_code().to_le_bytes());
        buffer.extend_from_slice(msg.data());

        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let dp = DataPack::new(1024);
        let frame = dp.pack(&Message::new(7, 2, 1, b"abc".to_vec())).unwrap();

        assert_eq!(frame.len(), DATA_PACK_HEAD_LEN + 3);
        assert_eq!(&frame[0..4], &3u32.to_le_bytes());
        assert_eq!(&frame[4..8], &7u32.to_le_bytes());
        assert_eq!(&frame[8..12], &2u32.to_le_bytes());
        assert_eq!(&frame[12..14], &1u16.to_le_bytes());
        assert_eq!(&frame[14..], b"abc");
    }

    #[test]
    fn test_unpack_reads_header_only() {
        let dp = DataPack::new(1024);
        let frame = dp.pack(&Message::new(11, 5, 0, vec![1, 2, 3, 4])).unwrap();

        let msg = dp.unpack(&frame[..dp.head_len()]).unwrap();
        assert_eq!(msg.id(), 11);
        assert_eq!(msg.serial(), 5);
        assert_eq!(msg.data_len(), 4);
        assert!(msg.data().is_empty());
    }

    #[test]
    fn test_unpack_rejects_oversized_body() {
        let dp = DataPack::new(16);
        let mut head = Vec::new();
        head.extend_from_slice(&17u32.to_le_bytes());
        head.extend_from_slice(&[0u8; 10]);

        assert_eq!(
            dp.unpack(&head),
            Err(CodecError::PacketTooLarge { size: 17, limit: 16 })
        );
    }

    #[test]
    fn test_unpack_short_header() {
        let dp = DataPack::new(0);
        assert!(matches!(
            dp.unpack(&[0u8; 4]),
            Err(CodecError::HeaderTooShort { expected: 14, actual: 4 })
        ));
    }

    #[test]
    fn test_zero_limit_disables_check() {
        let dp = DataPack::new(0);
        let payload = vec![0u8; 64 * 1024];
        assert!(dp.pack(&Message::new(1, 0, 0, payload)).is_ok());
    }

    #[test]
    fn test_pack_rejects_oversized_payload() {
        let dp = DataPack::new(2);
        assert!(matches!(
            dp.pack(&Message::new(1, 0, 0, b"abc".to_vec())),
            Err(CodecError::PacketTooLarge { size: 3, limit: 2 })
        ));
    }
}
