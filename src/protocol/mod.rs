//! Protocol module - wire format, codec, parsing and frame assembly.
//!
//! This module implements the framing layer shared by client and server:
//! - Packet configuration and field layout
//! - Packet value type, encoding and XOR checksum
//! - Command options byte
//! - Validating parser
//! - Per-connection frame assembler for partial reads

mod frame_buffer;
mod options;
mod packet;
mod parser;
mod wire_format;

pub use frame_buffer::{Assembled, FrameBuffer, Stage};
pub use options::{flags, CommandOptions};
pub use packet::{compute_checksum, encode, Packet, ACK_COMMAND};
pub use parser::{parse_fixed, parse_from_tail};
pub use wire_format::{
    decode_length, PacketConfig, CHECKSUM_SIZE, COMMAND_OPTIONS_SIZE, COMMAND_SIZE,
    DEFAULT_HEADER, DEFAULT_LENGTH_FIELD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE, DEFAULT_TAIL,
};
