//! Packet value type and byte-level codec.
//!
//! A [`Packet`] holds every field of one frame. Packets produced by the
//! parser share memory with the received buffer via `bytes::Bytes`.
//!
//! # Example
//!
//! ```
//! use packetwire::protocol::{CommandOptions, Packet, PacketConfig};
//!
//! let config = PacketConfig::default();
//! let options = CommandOptions::new().ack_required(true).build();
//! let packet = Packet::compose(&config, 0xAA, options, vec![1, 0, 0, 0]).unwrap();
//!
//! assert_eq!(packet.command(), 0xAA);
//! assert_eq!(packet.encode().len(), config.overhead() + 4);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::options::CommandOptions;
use super::wire_format::PacketConfig;
use crate::error::Result;

/// Command byte of the well-known acknowledgement frame.
pub const ACK_COMMAND: u8 = 0x00;

/// A complete protocol frame.
///
/// Immutable once constructed. Two packets are equal when their encoded
/// byte sequences are equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: Bytes,
    length: Bytes,
    command: u8,
    options: u8,
    payload: Bytes,
    checksum: u8,
    tail: Bytes,
}

impl Packet {
    /// Compose a packet from a command, options byte and payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::PayloadTooLarge`](crate::WireError::PayloadTooLarge)
    /// if the payload does not fit the configured length field.
    pub fn compose(
        config: &PacketConfig,
        command: u8,
        options: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self> {
        let payload = payload.into();
        let length = config.encode_length(payload.len())?;
        let checksum = compute_checksum(&length, command, options, &payload);

        Ok(Self {
            header: Bytes::copy_from_slice(config.header()),
            length,
            command,
            options,
            payload,
            checksum,
            tail: Bytes::copy_from_slice(config.tail()),
        })
    }

    /// The acknowledgement frame for a configuration.
    ///
    /// Command `0x00`, options `0x00`, zero-filled length field, no payload.
    pub fn ack(config: &PacketConfig) -> Self {
        let length = Bytes::from(vec![0u8; config.length_field_size()]);
        let checksum = compute_checksum(&length, ACK_COMMAND, 0, &[]);

        Self {
            header: Bytes::copy_from_slice(config.header()),
            length,
            command: ACK_COMMAND,
            options: 0,
            payload: Bytes::new(),
            checksum,
            tail: Bytes::copy_from_slice(config.tail()),
        }
    }

    /// Assemble a packet from already-validated slices.
    pub(crate) fn from_parts(
        header: Bytes,
        length: Bytes,
        command: u8,
        options: u8,
        payload: Bytes,
        checksum: u8,
        tail: Bytes,
    ) -> Self {
        Self {
            header,
            length,
            command,
            options,
            payload,
            checksum,
            tail,
        }
    }

    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// Raw length field bytes.
    #[inline]
    pub fn length_field(&self) -> &[u8] {
        &self.length
    }

    #[inline]
    pub fn command(&self) -> u8 {
        self.command
    }

    /// Raw options byte.
    #[inline]
    pub fn options_byte(&self) -> u8 {
        self.options
    }

    /// Decoded options.
    #[inline]
    pub fn options(&self) -> CommandOptions {
        CommandOptions::decode(self.options)
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get a clone of the payload as Bytes (cheap, zero-copy).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    #[inline]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    #[inline]
    pub fn tail(&self) -> &[u8] {
        &self.tail
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        self.header.len() + self.length.len() + 2 + self.payload.len() + 1 + self.tail.len()
    }

    /// Serialize the packet into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.header);
        buf.put_slice(&self.length);
        buf.put_u8(self.command);
        buf.put_u8(self.options);
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum);
        buf.put_slice(&self.tail);
        buf.freeze()
    }
}

/// Encode a frame from raw fields, computing the checksum.
pub fn encode(
    header: &[u8],
    length: &[u8],
    command: u8,
    options: u8,
    payload: &[u8],
    tail: &[u8],
) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(header.len() + length.len() + 3 + payload.len() + tail.len());
    buf.extend_from_slice(header);
    buf.extend_from_slice(length);
    buf.push(command);
    buf.push(options);
    buf.extend_from_slice(payload);
    buf.push(compute_checksum(length, command, options, payload));
    buf.extend_from_slice(tail);
    buf
}

/// XOR fold over `length ‖ command ‖ options ‖ payload`.
#[inline]
pub fn compute_checksum(length: &[u8], command: u8, options: u8, payload: &[u8]) -> u8 {
    let fold = |acc: u8, b: &u8| acc ^ b;
    let acc = length.iter().fold(0u8, fold) ^ command ^ options;
    payload.iter().fold(acc, fold)
}
