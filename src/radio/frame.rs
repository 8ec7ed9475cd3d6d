//! # Radio Bridge Framing
//!
//! The UART radio bridge forwards each received LoRa packet as
//!
//! ```text
//! [0x7E][len][len bytes of LoRa packet]
//! ```
//!
//! The LoRa packet itself usually starts with a 5-byte addressing header
//! `{net, dst, src, seq, len}` followed by `len` payload bytes. Senders
//! without the header transmit payload only.

use bytes::{Buf, BytesMut};
use tracing::debug;

/// Start-of-frame marker
pub const FRAME_START: u8 = 0x7E;

/// Marker + length byte
pub const FRAME_OVERHEAD: usize = 2;

/// Size of the LoRa addressing header
pub const LORA_HEADER_LEN: usize = 5;

/// LoRa addressing header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoraHeader {
    pub net: u8,
    pub dst: u8,
    pub src: u8,
    pub seq: u8,
    /// Declared payload length
    pub len: u8,
}

/// A LoRa packet split into header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    pub header: Option<LoraHeader>,
    pub payload: Vec<u8>,
}

/// Splits a LoRa packet into header and payload
///
/// # Arguments
///
/// * `packet` - Raw LoRa packet bytes as carried inside one bridge frame
///
/// # Returns
///
/// * `DecodedPacket` - Header (if the packet is long enough to carry one)
///   and the payload bytes. The payload is clamped to the bytes actually
///   present; trailing bytes beyond the declared length are dropped.
///
/// # Examples
///
/// ```
/// use field_gateway::radio::frame::decode_packet;
///
/// let packet = [0x01, 0xFF, 0x02, 0x07, 0x03, b'a', b'b', b'c', 0x00];
/// let decoded = decode_packet(&packet);
/// assert_eq!(decoded.header.unwrap().seq, 7);
/// assert_eq!(decoded.payload, b"abc");
/// ```
pub fn decode_packet(packet: &[u8]) -> DecodedPacket {
    if packet.len() < LORA_HEADER_LEN {
        return DecodedPacket {
            header: None,
            payload: packet.to_vec(),
        };
    }

    let header = LoraHeader {
        net: packet[0],
        dst: packet[1],
        src: packet[2],
        seq: packet[3],
        len: packet[4],
    };
    let remain = &packet[LORA_HEADER_LEN..];
    let take = (header.len as usize).min(remain.len());

    DecodedPacket {
        header: Some(header),
        payload: remain[..take].to_vec(),
    }
}

/// Reassembles bridge frames from an arbitrary byte stream
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    discarded: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the UART.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Total noise bytes skipped while hunting for a frame start
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Bytes waiting for a complete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame's packet bytes, if one is buffered.
    ///
    /// Bytes before a start marker are discarded. Zero-length frames are
    /// skipped.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|b| *b == FRAME_START) {
                Some(0) => {}
                Some(skip) => {
                    debug!("Discarding {} bytes before frame start", skip);
                    self.discarded += skip as u64;
                    self.buf.advance(skip);
                }
                None => {
                    self.discarded += self.buf.len() as u64;
                    self.buf.clear();
                    return None;
                }
            }

            if self.buf.len() < FRAME_OVERHEAD {
                return None;
            }
            let len = self.buf[1] as usize;
            if self.buf.len() < FRAME_OVERHEAD + len {
                return None;
            }

            self.buf.advance(FRAME_OVERHEAD);
            let packet = self.buf.split_to(len);
            if packet.is_empty() {
                continue;
            }
            return Some(packet.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(packet: &[u8]) -> Vec<u8> {
        let mut out = vec![FRAME_START, packet.len() as u8];
        out.extend_from_slice(packet);
        out
    }

    #[test]
    fn test_decode_packet_with_header() {
        let mut packet = vec![0x12, 0x01, 0x02, 0x09, 11];
        packet.extend_from_slice(b"S1,0A1B2C3D");
        let decoded = decode_packet(&packet);

        let header = decoded.header.unwrap();
        assert_eq!(header.net, 0x12);
        assert_eq!(header.src, 0x02);
        assert_eq!(header.len, 11);
        assert_eq!(decoded.payload, b"S1,0A1B2C3D");
    }

    #[test]
    fn test_decode_packet_clamps_declared_length() {
        let packet = [0, 0, 0, 0, 200, b'x', b'y'];
        assert_eq!(decode_packet(&packet).payload, b"xy");
    }

    #[test]
    fn test_decode_short_packet_is_payload_only() {
        let decoded = decode_packet(b"abcd");
        assert!(decoded.header.is_none());
        assert_eq!(decoded.payload, b"abcd");
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut buffer = FrameBuffer::new();
        let bytes = frame(b"hello");

        buffer.extend(&bytes[..3]);
        assert!(buffer.next_frame().is_none());
        buffer.extend(&bytes[3..]);
        assert_eq!(buffer.next_frame().unwrap(), b"hello");
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_noise_and_empty_frames_are_skipped() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&[0x00, 0x41, 0x42]);
        buffer.extend(&[FRAME_START, 0x00]);
        buffer.extend(&frame(b"one"));
        buffer.extend(&frame(b"two"));

        assert_eq!(buffer.next_frame().unwrap(), b"one");
        assert_eq!(buffer.next_frame().unwrap(), b"two");
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.discarded(), 3);
    }

    #[test]
    fn test_pure_noise_is_dropped() {
        let mut buffer = FrameBuffer::new();
        buffer.extend(&[1, 2, 3, 4]);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.pending(), 0);
        assert_eq!(buffer.discarded(), 4);
    }
}
