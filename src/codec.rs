//! Frame codec
//!
//! Pure functions that translate between raw CAN frames and the chunked
//! command/response layout:
//!
//! | byte   | content                                  |
//! |--------|------------------------------------------|
//! | 0      | opcode                                   |
//! | 1      | `(max_chunks << 4) \| chunk_id`, `1..=15` |
//! | 2..=7  | up to six bytes of opcode specific data  |
//!
//! All multi-byte numbers are little-endian, floats are IEEE-754 `f32`.

use crate::{CanAddr, CanAddrError, CHANNELS};

/// Maximum payload of a classic CAN frame
pub const FRAME_LEN: usize = 8;

/// Number of payload bytes left after the opcode and chunk header
pub const PAYLOAD_LEN: usize = 6;

/// Largest chunk number that fits in the chunk header nibble
pub const MAX_CHUNKS: u8 = 15;

/// A received or outgoing classic CAN frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct CanFrame {
    id: u16,
    len: u8,
    data: [u8; FRAME_LEN],
}

impl CanFrame {
    /// An empty frame with identifier zero
    pub const EMPTY: CanFrame = CanFrame {
        id: 0,
        len: 0,
        data: [0u8; FRAME_LEN],
    };

    /// Create a frame from an 11-bit identifier and up to 8 data bytes
    ///
    /// Returns [None] if the identifier is not a standard identifier, or
    /// if `data` is longer than 8 bytes.
    pub fn new(id: u16, data: &[u8]) -> Option<Self> {
        if id > 0x7FF || data.len() > FRAME_LEN {
            return None;
        }
        let mut buf = [0u8; FRAME_LEN];
        buf[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// The 11-bit identifier
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The data bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// Decoded view of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct MessageEnvelope {
    /// Short id of the device the frame is from (or to)
    pub device_short_id: u8,
    /// Set when the frame was sent by a device
    pub is_response: bool,
    /// Raw opcode byte
    pub opcode: u8,
    /// Position of this chunk, `1..=max_chunks`
    pub chunk_id: u8,
    /// Total number of chunks in this message
    pub max_chunks: u8,
    payload: [u8; PAYLOAD_LEN],
    payload_len: u8,
}

impl MessageEnvelope {
    /// The opcode specific bytes
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    /// Is this the chunk that completes the message?
    #[inline]
    pub fn is_last_chunk(&self) -> bool {
        self.chunk_id == self.max_chunks
    }
}

/// Reasons a frame could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[non_exhaustive]
pub enum DecodeError {
    /// The identifier is not an 11-bit identifier
    BadIdentifier,
    /// Fewer than two data bytes, so no opcode or no chunk header
    TooShort,
    /// `chunk_id` is zero, or larger than `max_chunks`
    BadChunk {
        /// The received chunk id
        chunk_id: u8,
        /// The received chunk count
        max_chunks: u8,
    },
}

impl From<CanAddrError> for DecodeError {
    fn from(_: CanAddrError) -> Self {
        DecodeError::BadIdentifier
    }
}

/// Pack a chunk header byte
#[inline]
pub const fn chunk_header(chunk_id: u8, max_chunks: u8) -> u8 {
    ((max_chunks & 0x0F) << 4) | (chunk_id & 0x0F)
}

/// Encode an 8 byte frame payload
///
/// `payload` is zero padded, or truncated, to six bytes.
pub fn encode(opcode: u8, payload: &[u8], chunk_id: u8, max_chunks: u8) -> [u8; FRAME_LEN] {
    let mut out = [0u8; FRAME_LEN];
    out[0] = opcode;
    out[1] = chunk_header(chunk_id, max_chunks);
    let used = payload.len().min(PAYLOAD_LEN);
    out[2..2 + used].copy_from_slice(&payload[..used]);
    out
}

/// Encode a single-chunk command to a device, ready for sending
pub fn encode_command(addr: CanAddr, opcode: u8, payload: &[u8]) -> CanFrame {
    CanFrame {
        id: addr.into(),
        len: FRAME_LEN as u8,
        data: encode(opcode, payload, 1, 1),
    }
}

/// Decode a frame into a [MessageEnvelope]
///
/// This does not look at the opcode, see [crate::dispatch] for that.
pub fn decode(identifier: u16, data: &[u8]) -> Result<MessageEnvelope, DecodeError> {
    let addr = CanAddr::try_from(identifier)?;
    let [opcode, header, rest @ ..] = data else {
        return Err(DecodeError::TooShort);
    };
    let chunk_id = header & 0x0F;
    let max_chunks = header >> 4;
    if chunk_id == 0 || chunk_id > max_chunks {
        return Err(DecodeError::BadChunk {
            chunk_id,
            max_chunks,
        });
    }

    let used = rest.len().min(PAYLOAD_LEN);
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..used].copy_from_slice(&rest[..used]);

    Ok(MessageEnvelope {
        device_short_id: addr.short_id,
        is_response: addr.response,
        opcode: *opcode,
        chunk_id,
        max_chunks,
        payload,
        payload_len: used as u8,
    })
}

/// Decode a received [CanFrame]
#[inline]
pub fn decode_frame(frame: &CanFrame) -> Result<MessageEnvelope, DecodeError> {
    decode(frame.id(), frame.data())
}

/// Read a little-endian `u16` at `at`, if there are enough bytes
pub fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `at`, if there are enough bytes
pub fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `f32` at `at`, if there are enough bytes
pub fn read_f32(buf: &[u8], at: usize) -> Option<f32> {
    read_u32(buf, at).map(f32::from_bits)
}

/// Channel selection mask
///
/// Bit `i` selects channel `i`. The value `0x00` does NOT mean "no channels":
/// it selects the timestamp pseudo-channel, index [ChannelMask::TIMESTAMP].
/// Devices rely on this, so it must not be "fixed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChannelMask(pub u8);

impl ChannelMask {
    /// Index of the timestamp pseudo-channel
    pub const TIMESTAMP: u8 = CHANNELS as u8;

    /// All eight analog channels
    pub const ALL: ChannelMask = ChannelMask(0xFF);

    /// A mask selecting a single analog channel
    ///
    /// Indices past the last analog channel select the timestamp pseudo-channel.
    pub const fn single(channel: u8) -> Self {
        if channel < Self::TIMESTAMP {
            ChannelMask(1 << channel)
        } else {
            ChannelMask(0)
        }
    }

    /// Does this mask select the timestamp pseudo-channel?
    #[inline]
    pub const fn is_timestamp(&self) -> bool {
        self.0 == 0
    }

    /// Does this mask select `channel`?
    pub const fn contains(&self, channel: u8) -> bool {
        if self.is_timestamp() {
            channel == Self::TIMESTAMP
        } else {
            channel < Self::TIMESTAMP && (self.0 & (1 << channel)) != 0
        }
    }

    /// Number of selected channels, counting the pseudo-channel as one
    pub const fn count(&self) -> u8 {
        if self.is_timestamp() {
            1
        } else {
            self.0.count_ones() as u8
        }
    }

    /// Iterate over the selected channel indices, in ascending order
    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        let mask = *self;
        (0..=Self::TIMESTAMP).filter(move |c| mask.contains(*c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Priority;

    #[test]
    fn encode_layout() {
        let out = encode(0xD1, &[0x01, 0xAA, 0xBB], 2, 3);
        assert_eq!(out, [0xD1, 0x32, 0x01, 0xAA, 0xBB, 0, 0, 0]);
    }

    #[test]
    fn encode_truncates_payload() {
        let out = encode(0x30, &[1, 2, 3, 4, 5, 6, 7, 8], 1, 1);
        assert_eq!(out, [0x30, 0x11, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn command_round_trips() {
        let alpha = 0.25f32.to_le_bytes();
        let payload = [0x05, alpha[0], alpha[1], alpha[2], alpha[3]];
        let frame = encode_command(CanAddr::command(35, Priority::Normal), 0xD1, &payload);
        assert_eq!(frame.id(), (35 << 2) | 1);

        let env = decode_frame(&frame).unwrap();
        assert_eq!(env.device_short_id, 35);
        assert!(!env.is_response);
        assert_eq!(env.opcode, 0xD1);
        assert_eq!(env.chunk_id, 1);
        assert_eq!(env.max_chunks, 1);
        assert!(env.is_last_chunk());
        assert_eq!(&env.payload()[..5], &payload);
        assert_eq!(read_f32(env.payload(), 1), Some(0.25));
    }

    #[test]
    fn response_flag_and_chunks() {
        let id = (1 << 10) | (7 << 2);
        let env = decode(id, &[0x00, 0x32, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert!(env.is_response);
        assert_eq!(env.device_short_id, 7);
        assert_eq!((env.chunk_id, env.max_chunks), (2, 3));
        assert!(!env.is_last_chunk());
        assert_eq!(read_u32(env.payload(), 0), Some(0x1234_5678));
        assert_eq!(read_u32(env.payload(), 1), None);
    }

    #[test]
    fn malformed_frames() {
        assert_eq!(decode(0x400, &[0x01]), Err(DecodeError::TooShort));
        assert_eq!(
            decode(0x400, &[0x01, 0x10]),
            Err(DecodeError::BadChunk {
                chunk_id: 0,
                max_chunks: 1
            })
        );
        assert_eq!(
            decode(0x400, &[0x01, 0x23]),
            Err(DecodeError::BadChunk {
                chunk_id: 3,
                max_chunks: 2
            })
        );
        assert_eq!(decode(0x1000, &[0x01, 0x11]), Err(DecodeError::BadIdentifier));
    }

    #[test]
    fn little_endian_numbers() {
        assert_eq!(read_u16(&[0x34, 0x12], 0), Some(0x1234));
        assert_eq!(read_f32(&1.5f32.to_le_bytes(), 0), Some(1.5));
    }

    #[test]
    fn zero_mask_is_timestamp_channel() {
        let mask = ChannelMask(0x00);
        assert!(mask.is_timestamp());
        let mut it = mask.channels();
        assert_eq!(it.next(), Some(8));
        assert_eq!(it.next(), None);
        assert_eq!(mask.count(), 1);
    }

    #[test]
    fn mask_selects_bits() {
        let mask = ChannelMask(0b0000_0101);
        let mut it = mask.channels();
        assert_eq!(it.next(), Some(0));
        assert_eq!(it.next(), Some(2));
        assert_eq!(it.next(), None);
        assert!(!mask.contains(8));
        assert_eq!(ChannelMask::single(3), ChannelMask(0b1000));
        assert_eq!(ChannelMask::single(8), ChannelMask(0));
    }
}
