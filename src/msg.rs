//! Wire message: the fixed-size record exchanged through a queue.
//!
//! The on-wire layout is bit-exact and must match at both ends:
//!
//! ```text
//! byte 0      channel id
//! byte 1      message kind
//! bytes 2..4  flag  (little-endian u16)
//! bytes 4..8  value (little-endian u32)
//! ```

/// Size of one wire record in bytes.
pub const MSG_SIZE: usize = 8;

/// Handshake tag carried in the `flag` field of an `OPEN` message.
pub const OPEN_MAGIC: u16 = 0xBEEE;

/// Message kind constants.
pub mod msg_kind {
    /// Channel open handshake (flag carries [`OPEN_MAGIC`](super::OPEN_MAGIC))
    pub const OPEN: u8 = 1;
    /// Channel close notification
    pub const CLOSE: u8 = 2;
    /// Ordinary data message
    pub const DATA: u8 = 3;
    /// Out-of-band event notification
    pub const EVENT: u8 = 4;
    /// Remote processor fault announcement
    pub const DIE: u8 = 5;

    /// One past the largest valid kind.
    pub const COUNT: u8 = 6;
}

/// Check whether a kind byte names a known message kind.
///
/// Kind 0 is reserved so that zeroed memory never decodes as a valid record.
#[inline]
pub const fn is_valid_kind(kind: u8) -> bool {
    kind >= msg_kind::OPEN && kind < msg_kind::COUNT
}

/// Kind name for logging.
pub const fn kind_name(kind: u8) -> &'static str {
    match kind {
        msg_kind::OPEN => "Open",
        msg_kind::CLOSE => "Close",
        msg_kind::DATA => "Data",
        msg_kind::EVENT => "Event",
        msg_kind::DIE => "Die",
        _ => "Unknown",
    }
}

/// One wire message. Copied by value everywhere; never fragmented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msg {
    /// Logical channel id, `< channel_count` of the transport.
    pub channel: u8,
    /// Message kind, see [`msg_kind`].
    pub kind: u8,
    /// Kind-specific 16-bit flag (handshake magic for `OPEN`).
    pub flag: u16,
    /// Kind-specific 32-bit value.
    pub value: u32,
}

impl Msg {
    /// Create a message with all fields explicit.
    #[inline]
    pub const fn new(channel: u8, kind: u8, flag: u16, value: u32) -> Self {
        Self {
            channel,
            kind,
            flag,
            value,
        }
    }

    /// Data message carrying `value`.
    #[inline]
    pub const fn data(channel: u8, value: u32) -> Self {
        Self::new(channel, msg_kind::DATA, 0, value)
    }

    /// Event message carrying `flag` and `value`.
    #[inline]
    pub const fn event(channel: u8, flag: u16, value: u32) -> Self {
        Self::new(channel, msg_kind::EVENT, flag, value)
    }

    /// Open handshake message, tagged with [`OPEN_MAGIC`].
    #[inline]
    pub const fn open(channel: u8) -> Self {
        Self::new(channel, msg_kind::OPEN, OPEN_MAGIC, 0)
    }

    /// Close notification.
    #[inline]
    pub const fn close(channel: u8) -> Self {
        Self::new(channel, msg_kind::CLOSE, 0, 0)
    }

    /// Remote fault announcement. Addressed to channel 0 but handled before
    /// any per-channel delivery.
    #[inline]
    pub const fn die(value: u32) -> Self {
        Self::new(0, msg_kind::DIE, 0, value)
    }

    /// Encode to the bit-exact wire layout.
    #[inline]
    pub fn to_bytes(self) -> [u8; MSG_SIZE] {
        let mut out = [0u8; MSG_SIZE];
        out[0] = self.channel;
        out[1] = self.kind;
        out[2..4].copy_from_slice(&self.flag.to_le_bytes());
        out[4..8].copy_from_slice(&self.value.to_le_bytes());
        out
    }

    /// Decode from the wire layout. Field values are taken as-is; bounds and
    /// kind validation happen at the delivery path.
    #[inline]
    pub fn from_bytes(bytes: [u8; MSG_SIZE]) -> Self {
        Self {
            channel: bytes[0],
            kind: bytes[1],
            flag: u16::from_le_bytes([bytes[2], bytes[3]]),
            value: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
