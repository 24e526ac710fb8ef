//! Error taxonomy for the messaging core.
//!
//! Every public operation returns one of these directly to the caller; there
//! are no internal retries. The only silent data loss happens inside the
//! delivery path (cache full, malformed record), and both points are logged
//! and counted in [`TransportStats`](crate::transport::TransportStats).

/// Errors returned by the process-context API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The outbound queue is full; the message was not enqueued.
    QueueFull,
    /// The channel is not in the `Opened` state (or the id is out of range).
    ChannelNotOpen,
    /// Malformed or mismatched handshake (wrong kind or magic).
    ProtocolError,
    /// Non-blocking receive found an empty cache.
    NoData,
    /// The per-channel consume lock is held, or the channel is already
    /// claimed by another opener.
    Busy,
    /// The bounded wait expired.
    Timeout,
    /// The channel transitioned to `Free` while waiting.
    ChannelClosed,
    /// No transport is registered for the given remote id.
    DeviceUnavailable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::QueueFull => write!(f, "outbound queue is full"),
            Error::ChannelNotOpen => write!(f, "channel is not open"),
            Error::ProtocolError => write!(f, "protocol error during handshake"),
            Error::NoData => write!(f, "no message available"),
            Error::Busy => write!(f, "channel is busy"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ChannelClosed => write!(f, "channel was closed"),
            Error::DeviceUnavailable => write!(f, "no transport for remote id"),
        }
    }
}

impl std::error::Error for Error {}
