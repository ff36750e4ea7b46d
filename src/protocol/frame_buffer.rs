//! Per-connection frame assembler.
//!
//! A byte-at-a-time state machine that accumulates raw socket reads until a
//! whole frame has been seen:
//!
//! ```text
//! Header → Length → Command → CommandOptions → Payload → Checksum → Tail
//!    ↑                                  │ (length == 0)  ↑            │
//!    │                                  └────────────────┘            │
//!    └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stage boundaries are counted, not matched: field contents are validated
//! afterwards by the parser. The payload stage length comes from the length
//! field just read.
//!
//! # Example
//!
//! ```
//! use packetwire::protocol::{Assembled, FrameBuffer, Packet, PacketConfig};
//!
//! let config = PacketConfig::default();
//! let bytes = Packet::compose(&config, 1, 0, &b"hi"[..]).unwrap().encode();
//!
//! let mut buffer = FrameBuffer::new(&config);
//! assert!(buffer.push(&bytes[..5]).is_empty());
//! let out = buffer.push(&bytes[5..]);
//! assert!(matches!(&out[..], [Assembled::Complete(frame)] if *frame == bytes));
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{decode_length, PacketConfig, COMMAND_OPTIONS_SIZE, COMMAND_SIZE};

/// Frame field currently being consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Header,
    Length,
    Command,
    CommandOptions,
    Payload,
    Checksum,
    Tail,
}

/// Output of the assembler for one frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// All bytes from header through tail, ready for the parser.
    Complete(Bytes),
    /// The length field announced more than the configured maximum; the
    /// accumulated bytes were discarded.
    Oversized { declared: u64 },
}

/// Accumulates bytes for a single connection.
#[derive(Debug)]
pub struct FrameBuffer {
    header_size: usize,
    length_size: usize,
    tail_size: usize,
    max_payload_size: u64,
    /// Bytes seen since the last frame boundary.
    buffer: BytesMut,
    /// Length field bytes collected so far.
    length_field: Vec<u8>,
    payload_size: u64,
    stage: Stage,
    /// Bytes consumed within the current stage.
    index: u64,
}

impl FrameBuffer {
    /// Create an empty assembler for the given layout.
    pub fn new(config: &PacketConfig) -> Self {
        Self {
            header_size: config.header().len(),
            length_size: config.length_field_size(),
            tail_size: config.tail().len(),
            max_payload_size: config.max_payload_size(),
            buffer: BytesMut::with_capacity(1024),
            length_field: Vec::with_capacity(config.length_field_size()),
            payload_size: 0,
            stage: Stage::Header,
            index: 0,
        }
    }

    /// Feed a chunk of received bytes.
    ///
    /// Returns every frame boundary reached within the chunk, in order.
    /// Partial trailing data stays buffered for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<Assembled> {
        let mut out = Vec::new();
        for &byte in data {
            if let Some(assembled) = self.push_byte(byte) {
                out.push(assembled);
            }
        }
        out
    }

    /// Feed a single byte.
    pub fn push_byte(&mut self, byte: u8) -> Option<Assembled> {
        self.buffer.extend_from_slice(&[byte]);
        self.index += 1;

        match self.stage {
            Stage::Header => {
                if self.index == self.header_size as u64 {
                    self.advance(Stage::Length);
                }
            }
            Stage::Length => {
                self.length_field.push(byte);
                if self.index == self.length_size as u64 {
                    let declared = decode_length(&self.length_field).unwrap_or(u64::MAX);
                    if declared > self.max_payload_size {
                        self.reset();
                        return Some(Assembled::Oversized { declared });
                    }
                    self.payload_size = declared;
                    self.advance(Stage::Command);
                }
            }
            Stage::Command => {
                if self.index == COMMAND_SIZE as u64 {
                    self.advance(Stage::CommandOptions);
                }
            }
            Stage::CommandOptions => {
                if self.index == COMMAND_OPTIONS_SIZE as u64 {
                    if self.payload_size == 0 {
                        self.advance(Stage::Checksum);
                    } else {
                        self.advance(Stage::Payload);
                    }
                }
            }
            Stage::Payload => {
                if self.index == self.payload_size {
                    self.advance(Stage::Checksum);
                }
            }
            Stage::Checksum => {
                self.advance(Stage::Tail);
            }
            Stage::Tail => {
                if self.index == self.tail_size as u64 {
                    let frame = self.buffer.split().freeze();
                    self.reset();
                    return Some(Assembled::Complete(frame));
                }
            }
        }

        None
    }

    #[inline]
    fn advance(&mut self, next: Stage) {
        self.stage = next;
        self.index = 0;
    }

    /// Discard buffered bytes and return to the header stage.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.length_field.clear();
        self.payload_size = 0;
        self.stage = Stage::Header;
        self.index = 0;
    }

    /// Current stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
