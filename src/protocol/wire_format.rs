//! Wire format definition and packet configuration.
//!
//! Frame layout (default sizes):
//! ```text
//! ┌────────┬────────┬─────────┬─────────┬──────────┬──────┬──────┐
//! │ Header │ Length │ Command │ Options │ Payload  │ CRC  │ Tail │
//! │ 3 bytes│ 4 bytes│ 1 byte  │ 1 byte  │ N bytes  │1 byte│2 byte│
//! │ $ M >  │ u32 LE │         │         │          │ XOR  │ \r\n │
//! └────────┴────────┴─────────┴─────────┴──────────┴──────┴──────┘
//! ```
//!
//! The length field is little endian and counts payload bytes only.

use bytes::Bytes;

use crate::error::{Result, WireError};

/// Default frame header magic (`$M>`).
pub const DEFAULT_HEADER: [u8; 3] = [0x24, 0x4D, 0x3E];

/// Default frame tail marker (`\r\n`).
pub const DEFAULT_TAIL: [u8; 2] = [0x0D, 0x0A];

/// Size of the command field in bytes.
pub const COMMAND_SIZE: usize = 1;

/// Size of the command options field in bytes.
pub const COMMAND_OPTIONS_SIZE: usize = 1;

/// Size of the checksum field in bytes.
pub const CHECKSUM_SIZE: usize = 1;

/// Default width of the length field in bytes.
pub const DEFAULT_LENGTH_FIELD_SIZE: usize = 4;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 16 * 1024 * 1024;

/// Immutable framing configuration shared by both endpoints.
///
/// Client and server must agree on every field, otherwise frames are
/// rejected by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConfig {
    header: Bytes,
    tail: Bytes,
    length_field_size: usize,
    max_payload_size: u64,
}

impl PacketConfig {
    /// Create a configuration with custom header and tail markers.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Config`] if either marker is empty.
    pub fn new(header: impl Into<Bytes>, tail: impl Into<Bytes>) -> Result<Self> {
        Self::with_layout(
            header,
            tail,
            DEFAULT_LENGTH_FIELD_SIZE,
            DEFAULT_MAX_PAYLOAD_SIZE,
        )
    }

    /// Create a configuration with every field specified.
    ///
    /// The length field may be 1 to 8 bytes wide. `max_payload_size` is
    /// clamped to what the length field can express.
    pub fn with_layout(
        header: impl Into<Bytes>,
        tail: impl Into<Bytes>,
        length_field_size: usize,
        max_payload_size: u64,
    ) -> Result<Self> {
        let header = header.into();
        let tail = tail.into();

        if header.is_empty() {
            return Err(WireError::Config("header must not be empty".to_string()));
        }
        if tail.is_empty() {
            return Err(WireError::Config("tail must not be empty".to_string()));
        }
        if !(1..=8).contains(&length_field_size) {
            return Err(WireError::Config(format!(
                "length field size {} outside 1..=8",
                length_field_size
            )));
        }

        let max_payload_size = max_payload_size.min(max_for_width(length_field_size));

        Ok(Self {
            header,
            tail,
            length_field_size,
            max_payload_size,
        })
    }

    /// Header marker bytes.
    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Tail marker bytes.
    #[inline]
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// Width of the length field in bytes.
    #[inline]
    pub fn length_field_size(&self) -> usize {
        self.length_field_size
    }

    /// Largest payload accepted in either direction.
    #[inline]
    pub fn max_payload_size(&self) -> u64 {
        self.max_payload_size
    }

    /// Bytes a frame occupies besides its payload.
    #[inline]
    pub fn overhead(&self) -> usize {
        self.header.len()
            + self.length_field_size
            + COMMAND_SIZE
            + COMMAND_OPTIONS_SIZE
            + CHECKSUM_SIZE
            + self.tail.len()
    }

    /// Offset of the length field.
    #[inline]
    pub(crate) fn length_offset(&self) -> usize {
        self.header.len()
    }

    /// Offset of the command byte.
    #[inline]
    pub(crate) fn command_offset(&self) -> usize {
        self.header.len() + self.length_field_size
    }

    /// Offset of the first payload byte.
    #[inline]
    pub(crate) fn payload_offset(&self) -> usize {
        self.command_offset() + COMMAND_SIZE + COMMAND_OPTIONS_SIZE
    }

    /// Encode a payload length into the configured field width.
    pub fn encode_length(&self, len: usize) -> Result<Bytes> {
        if len as u64 > self.max_payload_size {
            return Err(WireError::PayloadTooLarge {
                len,
                max: self.max_payload_size,
            });
        }
        let bytes = (len as u64).to_le_bytes();
        Ok(Bytes::copy_from_slice(&bytes[..self.length_field_size]))
    }
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            header: Bytes::from_static(&DEFAULT_HEADER),
            tail: Bytes::from_static(&DEFAULT_TAIL),
            length_field_size: DEFAULT_LENGTH_FIELD_SIZE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Decode a little-endian length field of any width up to 8 bytes.
///
/// Returns `None` for an empty or over-wide field.
#[inline]
pub fn decode_length(field: &[u8]) -> Option<u64> {
    if field.is_empty() || field.len() > 8 {
        return None;
    }
    Some(
        field
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    )
}

fn max_for_width(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let config = PacketConfig::default();
        assert_eq!(config.header(), &[0x24, 0x4D, 0x3E]);
        assert_eq!(config.tail(), &[0x0D, 0x0A]);
        assert_eq!(config.length_field_size(), 4);
        assert_eq!(config.overhead(), 3 + 4 + 1 + 1 + 1 + 2);
        assert_eq!(config.command_offset(), 7);
        assert_eq!(config.payload_offset(), 9);
    }

    #[test]
    fn test_empty_markers_rejected() {
        let result = PacketConfig::new(Bytes::new(), &b"\r\n"[..]);
        assert!(matches!(result, Err(WireError::Config(_))));

        let result = PacketConfig::new(&b"$M>"[..], Bytes::new());
        assert!(result.unwrap_err().to_string().contains("tail"));
    }

    #[test]
    fn test_length_width_bounds() {
        assert!(PacketConfig::with_layout(&b"H"[..], &b"T"[..], 0, 10).is_err());
        assert!(PacketConfig::with_layout(&b"H"[..], &b"T"[..], 9, 10).is_err());

        let narrow = PacketConfig::with_layout(&b"H"[..], &b"T"[..], 1, u64::MAX).unwrap();
        assert_eq!(narrow.max_payload_size(), 255);
    }

    #[test]
    fn test_length_little_endian() {
        let config = PacketConfig::default();
        let field = config.encode_length(0x0102).unwrap();
        assert_eq!(&field[..], &[0x02, 0x01, 0x00, 0x00]);
        assert_eq!(decode_length(&field), Some(0x0102));
    }

    #[test]
    fn test_encode_length_too_large() {
        let config = PacketConfig::with_layout(&b"H"[..], &b"T"[..], 4, 8).unwrap();
        let result = config.encode_length(9);
        assert!(matches!(
            result,
            Err(WireError::PayloadTooLarge { len: 9, max: 8 })
        ));
    }

    #[test]
    fn test_decode_length_rejects_bad_width() {
        assert_eq!(decode_length(&[]), None);
        assert_eq!(decode_length(&[0; 9]), None);
        assert_eq!(decode_length(&[0xFF; 8]), Some(u64::MAX));
    }
}
