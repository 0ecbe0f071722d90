//! Packet structures and wire codec
//!
//! Every packet on the wire is an 8-byte header followed by a typed payload.
//! The codec is deliberately lenient: parsing a payload shorter than its
//! minimum yields a default-constructed packet, and unknown header fields
//! pass through untouched. Stricter checks belong to the layers above.

/// Size of the fixed packet header on the wire
pub const PACKET_HEADER_SIZE: usize = 8;

/// Bit 0 of the header flags: payload is an XOR delta frame
pub const FLAG_DELTA: u8 = 0x01;
/// Bits 1-2 of the header flags: compression level (reserved)
pub const FLAG_COMPRESS_1: u8 = 0x02;
pub const FLAG_COMPRESS_2: u8 = 0x04;

/// Packet type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    VideoFrame = 0x01,
    AudioChunk = 0x02,
    InputEvent = 0x03,
    Config = 0x04,
    DebugInfo = 0x05,
}

impl PacketType {
    /// Decode a wire byte, `None` for unknown types
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::VideoFrame),
            0x02 => Some(Self::AudioChunk),
            0x03 => Some(Self::InputEvent),
            0x04 => Some(Self::Config),
            0x05 => Some(Self::DebugInfo),
            _ => None,
        }
    }
}

// ============================================================================
// PacketHeader
// ============================================================================

/// Fixed 8-byte packet header
///
/// Wire layout (big-endian): `type(1) flags(1) sequence(2) length(4)`.
/// The type is kept as a raw byte so that unknown packet types survive
/// parsing and can be logged and skipped by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: u8,
    pub flags: u8,
    pub sequence: u16,
    pub length: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, flags: u8, length: u32) -> Self {
        Self {
            packet_type: packet_type as u8,
            flags,
            sequence: 0,
            length,
        }
    }

    /// Known packet type, `None` when the byte is unrecognized
    pub fn kind(&self) -> Option<PacketType> {
        PacketType::from_byte(self.packet_type)
    }

    pub fn serialize(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut bytes = [0u8; PACKET_HEADER_SIZE];
        bytes[0] = self.packet_type;
        bytes[1] = self.flags;
        bytes[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Parse the first 8 bytes of `data`. Callers guarantee `data.len() >= 8`.
    pub fn parse(data: &[u8]) -> Self {
        Self {
            packet_type: data[0],
            flags: data[1],
            sequence: u16::from_be_bytes([data[2], data[3]]),
            length: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        }
    }
}

// ============================================================================
// VideoFramePacket
// ============================================================================

/// Video frame payload: `width(2) height(2) data(length-4)`
///
/// `data` is either a keyframe (raw or codec-compressed bytes the relay does
/// not interpret) or, when the header carries [`FLAG_DELTA`], a byte-wise XOR
/// of the current raw frame against the previous one. `is_delta` mirrors the
/// header flag; it is not part of the payload encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFramePacket {
    pub width: u16,
    pub height: u16,
    pub is_delta: bool,
    pub data: Vec<u8>,
}

impl VideoFramePacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.extend_from_slice(&self.width.to_be_bytes());
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn parse(data: &[u8]) -> Self {
        if data.len() < 4 {
            return Self::default();
        }
        Self {
            width: u16::from_be_bytes([data[0], data[1]]),
            height: u16::from_be_bytes([data[2], data[3]]),
            is_delta: false,
            data: data[4..].to_vec(),
        }
    }

    /// XOR of `current` against `previous`. Equal lengths are a caller
    /// precondition.
    pub fn compute_delta(current: &[u8], previous: &[u8]) -> Vec<u8> {
        debug_assert_eq!(current.len(), previous.len());
        current.iter().zip(previous).map(|(c, p)| c ^ p).collect()
    }

    /// Apply a delta in place: `output[i] ^= delta[i]`. Equal lengths are a
    /// caller precondition.
    pub fn apply_delta(output: &mut [u8], delta: &[u8]) {
        debug_assert_eq!(output.len(), delta.len());
        for (out, d) in output.iter_mut().zip(delta) {
            *out ^= d;
        }
    }
}

// ============================================================================
// InputEventPacket
// ============================================================================

/// Input event payload: `buttons(2) reserved(2)`
///
/// The button bitmask is opaque to the relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputEventPacket {
    pub buttons: u16,
    pub reserved: u16,
}

impl InputEventPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.extend_from_slice(&self.buttons.to_be_bytes());
        bytes.extend_from_slice(&self.reserved.to_be_bytes());
        bytes
    }

    pub fn parse(data: &[u8]) -> Self {
        if data.len() < 4 {
            return Self::default();
        }
        Self {
            buttons: u16::from_be_bytes([data[0], data[1]]),
            reserved: u16::from_be_bytes([data[2], data[3]]),
        }
    }
}

// ============================================================================
// AudioChunkPacket
// ============================================================================

/// Audio chunk payload: `sample_rate(2) channels(1) samples(2 each)`
///
/// The sample count is derived from the payload length: `(length - 3) / 2`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioChunkPacket {
    pub sample_rate: u16,
    pub channels: u8,
    pub samples: Vec<i16>,
}

impl AudioChunkPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(3 + self.samples.len() * 2);
        bytes.extend_from_slice(&self.sample_rate.to_be_bytes());
        bytes.push(self.channels);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_be_bytes());
        }
        bytes
    }

    pub fn parse(data: &[u8]) -> Self {
        if data.len() < 3 {
            return Self::default();
        }
        let count = (data.len() - 3) / 2;
        let mut samples = Vec::with_capacity(count);
        for i in 0..count {
            let offset = 3 + i * 2;
            samples.push(i16::from_be_bytes([data[offset], data[offset + 1]]));
        }
        Self {
            sample_rate: u16::from_be_bytes([data[0], data[1]]),
            channels: data[2],
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader {
            packet_type: PacketType::AudioChunk as u8,
            flags: FLAG_DELTA,
            sequence: 0x1234,
            length: 0xDEADBEEF,
        };
        let bytes = header.serialize();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE);
        assert_eq!(PacketHeader::parse(&bytes), header);
    }

    #[test]
    fn test_header_wire_layout() {
        let header = PacketHeader::new(PacketType::VideoFrame, 0, 7);
        // type(01) flags(00) seq(00 00) length(00 00 00 07)
        assert_eq!(
            header.serialize(),
            [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07]
        );
    }

    #[test]
    fn test_video_frame_wire_layout() {
        let packet = VideoFramePacket {
            width: 64,
            height: 32,
            is_delta: false,
            data: vec![0xAA, 0xBB, 0xCC],
        };
        let payload = packet.serialize();
        assert_eq!(payload, [0x00, 0x40, 0x00, 0x20, 0xAA, 0xBB, 0xCC]);

        let header = PacketHeader::new(PacketType::VideoFrame, 0, payload.len() as u32);
        let mut wire = header.serialize().to_vec();
        wire.extend_from_slice(&payload);
        assert_eq!(
            wire,
            [
                0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07, 0x00, 0x40, 0x00, 0x20, 0xAA,
                0xBB, 0xCC
            ]
        );

        assert_eq!(VideoFramePacket::parse(&payload), packet);
    }

    #[test]
    fn test_video_frame_short_payload() {
        assert_eq!(
            VideoFramePacket::parse(&[0x00, 0x40]),
            VideoFramePacket::default()
        );
    }

    #[test]
    fn test_input_event_roundtrip() {
        let packet = InputEventPacket {
            buttons: 0b1010_0101_0000_0001,
            reserved: 0,
        };
        let payload = packet.serialize();
        assert_eq!(payload.len(), 4);
        assert_eq!(InputEventPacket::parse(&payload), packet);
    }

    #[test]
    fn test_audio_chunk_roundtrip() {
        let packet = AudioChunkPacket {
            sample_rate: 44100,
            channels: 2,
            samples: vec![0, -1, 32767, -32768],
        };
        let payload = packet.serialize();
        assert_eq!(payload.len(), 3 + 8);
        assert_eq!(AudioChunkPacket::parse(&payload), packet);
    }

    #[test]
    fn test_audio_chunk_sample_count_from_length() {
        // 3-byte prefix plus an odd trailing byte: the partial sample is
        // dropped, not misread.
        let payload = [0xAC, 0x44, 0x01, 0x12, 0x34, 0x56];
        let packet = AudioChunkPacket::parse(&payload);
        assert_eq!(packet.sample_rate, 44100);
        assert_eq!(packet.channels, 1);
        assert_eq!(packet.samples, vec![0x1234]);
    }

    #[test]
    fn test_delta_roundtrip() {
        let previous = [0x00u8, 0xFF, 0x55, 0xAA, 0x12];
        let current = [0x01u8, 0xFE, 0x55, 0x00, 0x21];

        let delta = VideoFramePacket::compute_delta(&current, &previous);
        let mut restored = previous;
        VideoFramePacket::apply_delta(&mut restored, &delta);
        assert_eq!(restored, current);
    }

    #[test]
    fn test_delta_of_identical_frames_is_zero() {
        let frame = [0x42u8; 16];
        let delta = VideoFramePacket::compute_delta(&frame, &frame);
        assert!(delta.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unknown_packet_type() {
        assert_eq!(PacketType::from_byte(0x00), None);
        assert_eq!(PacketType::from_byte(0x06), None);
        assert_eq!(PacketType::from_byte(0x03), Some(PacketType::InputEvent));

        let header = PacketHeader::parse(&[0x7F, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(header.kind(), None);
        assert_eq!(header.packet_type, 0x7F);
    }
}
