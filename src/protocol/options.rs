//! Command options byte.
//!
//! ```text
//! bit 0  acknowledgement required
//! bit 1  response required
//! 2..7   reserved, ignored on decode
//! ```
//!
//! With neither bit set the send is fire-and-forget.

/// Flag constants for the options byte.
pub mod flags {
    /// Peer must reply with the well-known ACK frame.
    pub const ACK_REQUIRED: u8 = 0b0000_0001;
    /// Peer must reply with a response frame.
    pub const RESPONSE_REQUIRED: u8 = 0b0000_0010;

    /// Reserved bits mask (bits 2-7).
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(options: u8, flag: u8) -> bool {
        options & flag != 0
    }
}

/// Decoded command options.
///
/// Also serves as the composer for the options byte:
///
/// ```
/// use packetwire::protocol::CommandOptions;
///
/// let byte = CommandOptions::new().ack_required(true).build();
/// assert_eq!(byte, 0x01);
/// assert!(CommandOptions::decode(byte).is_ack_required());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandOptions {
    ack_required: bool,
    response_required: bool,
}

impl CommandOptions {
    /// Options with no flags set (fire-and-forget).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or clear the acknowledgement flag.
    #[must_use]
    pub fn ack_required(mut self, required: bool) -> Self {
        self.ack_required = required;
        self
    }

    /// Set or clear the response flag.
    #[must_use]
    pub fn response_required(mut self, required: bool) -> Self {
        self.response_required = required;
        self
    }

    /// Compose the options byte.
    pub fn build(self) -> u8 {
        let mut byte = 0u8;
        if self.ack_required {
            byte |= flags::ACK_REQUIRED;
        }
        if self.response_required {
            byte |= flags::RESPONSE_REQUIRED;
        }
        byte
    }

    /// Decode an options byte. Reserved bits are ignored.
    pub fn decode(byte: u8) -> Self {
        Self {
            ack_required: flags::has_flag(byte, flags::ACK_REQUIRED),
            response_required: flags::has_flag(byte, flags::RESPONSE_REQUIRED),
        }
    }

    #[inline]
    pub fn is_ack_required(&self) -> bool {
        self.ack_required
    }

    #[inline]
    pub fn is_response_required(&self) -> bool {
        self.response_required
    }

    /// True when the sender expects any reply at all.
    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.ack_required || self.response_required
    }

    /// True when the receiving server should answer with the ACK frame.
    #[inline]
    pub fn wants_ack_only(&self) -> bool {
        self.ack_required && !self.response_required
    }
}

impl From<CommandOptions> for u8 {
    fn from(options: CommandOptions) -> u8 {
        options.build()
    }
}
