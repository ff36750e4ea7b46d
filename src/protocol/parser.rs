//! Validating frame parser.
//!
//! Both entry points are total: malformed input yields `None`, never a
//! panic. Validation short-circuits at the first mismatching field in this
//! order: header, length presence, command/options presence, payload bounds,
//! checksum, tail.

use bytes::Bytes;

use super::packet::{compute_checksum, Packet};
use super::wire_format::{decode_length, PacketConfig, CHECKSUM_SIZE};

/// Parse a frame that starts at offset 0 of `buf`.
///
/// Bytes after the frame's tail are ignored. The returned packet slices
/// `buf` without copying.
pub fn parse_fixed(config: &PacketConfig, buf: &Bytes) -> Option<Packet> {
    parse_fields(config, buf).map(|(packet, _)| packet)
}

/// Parse a frame occupying exactly the first `received` bytes of `buf`.
///
/// The tail is checked first at `received - tail.len()`, then the frame is
/// validated from the header forward. The length field must place the tail
/// exactly where it was found, so a payload that happens to end in the tail
/// sequence is not mistaken for a shorter frame.
pub fn parse_from_tail(config: &PacketConfig, buf: &Bytes, received: usize) -> Option<Packet> {
    let tail = config.tail();
    if received > buf.len() || received < tail.len() {
        return None;
    }
    if &buf[received - tail.len()..received] != tail {
        return None;
    }

    let window = buf.slice(..received);
    match parse_fields(config, &window) {
        Some((packet, end)) if end == received => Some(packet),
        _ => None,
    }
}

/// Validate every field and return the packet plus the offset just past
/// its tail.
fn parse_fields(config: &PacketConfig, buf: &Bytes) -> Option<(Packet, usize)> {
    let header = config.header();
    if buf.len() < header.len() || &buf[..header.len()] != header {
        return None;
    }

    let length_start = config.length_offset();
    let command_start = config.command_offset();
    if buf.len() < command_start {
        return None;
    }
    let length_field = &buf[length_start..command_start];

    let payload_start = config.payload_offset();
    if buf.len() < payload_start {
        return None;
    }
    let command = buf[command_start];
    let options = buf[command_start + 1];

    let payload_len = decode_length(length_field)?;
    if payload_len > config.max_payload_size() {
        return None;
    }
    let payload_end = payload_start.checked_add(usize::try_from(payload_len).ok()?)?;
    if payload_end + CHECKSUM_SIZE > buf.len() {
        return None;
    }

    let payload = &buf[payload_start..payload_end];
    let checksum = buf[payload_end];
    if checksum != compute_checksum(length_field, command, options, payload) {
        return None;
    }

    let tail = config.tail();
    let tail_start = payload_end + CHECKSUM_SIZE;
    let tail_end = tail_start + tail.len();
    if tail_end > buf.len() || &buf[tail_start..tail_end] != tail {
        return None;
    }

    let packet = Packet::from_parts(
        buf.slice(..length_start),
        buf.slice(length_start..command_start),
        command,
        options,
        buf.slice(payload_start..payload_end),
        checksum,
        buf.slice(tail_start..tail_end),
    );

    Some((packet, tail_end))
}
