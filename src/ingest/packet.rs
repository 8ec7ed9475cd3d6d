//! # Packet Validation
//!
//! Radio payloads are UTF-8 text frames `"<source_id>,<tag_id>"`.

use thiserror::Error;

use crate::record::{is_valid_source_id, normalize_tag_id};

/// Shortest accepted payload in bytes
pub const MIN_PACKET_LEN: usize = 6;

/// Longest accepted payload in bytes
pub const MAX_PACKET_LEN: usize = 64;

/// Why a payload was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("payload length {0} outside 6..=64")]
    Length(usize),

    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("payload has no ',' separator")]
    MissingSeparator,

    #[error("invalid source id {0:?}")]
    InvalidSource(String),

    #[error("invalid tag id {0:?}")]
    InvalidTag(String),
}

/// A payload that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPacket {
    pub source_id: String,
    /// Uppercased
    pub tag_id: String,
}

/// Validates and normalizes a raw radio payload
///
/// Splits at the first comma. The tag id is uppercased.
///
/// # Examples
///
/// ```
/// use field_gateway::ingest::packet::validate_packet;
///
/// let packet = validate_packet(b"S1,0a1b2c3d").unwrap();
/// assert_eq!(packet.source_id, "S1");
/// assert_eq!(packet.tag_id, "0A1B2C3D");
/// assert!(validate_packet(b"S1;0A1B2C3D").is_err());
/// ```
pub fn validate_packet(payload: &[u8]) -> Result<ValidPacket, PacketError> {
    if payload.len() < MIN_PACKET_LEN || payload.len() > MAX_PACKET_LEN {
        return Err(PacketError::Length(payload.len()));
    }
    let text = std::str::from_utf8(payload).map_err(|_| PacketError::NotUtf8)?;
    let (source_id, tag_id) = text.split_once(',').ok_or(PacketError::MissingSeparator)?;

    if !is_valid_source_id(source_id) {
        return Err(PacketError::InvalidSource(source_id.to_string()));
    }
    let tag_id = normalize_tag_id(tag_id).ok_or_else(|| PacketError::InvalidTag(tag_id.to_string()))?;

    Ok(ValidPacket {
        source_id: source_id.to_string(),
        tag_id,
    })
}
