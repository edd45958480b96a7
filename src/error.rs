//! Error types surfaced by the core.

/// Errors from decoding or encoding the wire framing (header + event block).
///
/// Variants that arise while parsing an inbound datagram are always
/// recovered from locally by dropping the datagram; they are returned so
/// the caller can log them, not so it can retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The datagram did not start with [`crate::header::PROTOCOL_TAG`].
    #[error("protocol tag mismatch")]
    ProtocolMismatch,
    /// Fewer than [`crate::header::HEADER_LEN`] bytes were available.
    #[error("malformed header")]
    MalformedHeader,
    /// An event's declared length ran past the end of the buffer.
    #[error("malformed event block")]
    MalformedEventBlock,
    /// Encoding the packet would exceed the configured maximum datagram
    /// size.
    #[error("packet exceeds maximum datagram size")]
    Overflow,
}

/// Errors from updating a connection's received-sequence bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AckError {
    /// The sequence was already recorded, or is stale beyond the 32-entry
    /// ack window and cannot be safely distinguished from a duplicate.
    #[error("duplicate or stale sequence number")]
    DuplicateSequence,
}
