//! Wire-format parse errors.

use thiserror::Error;

/// Failure modes when turning raw bytes into an [`crate::message::IncomingMessage`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer was shorter than the fixed BOOTP header, or an option
    /// claimed a length that ran past the end of the buffer.
    #[error("truncated DHCP message")]
    Truncated,

    /// The four bytes at `OFFSET_MAGIC_COOKIE` were not `MAGIC_COOKIE`.
    #[error("bad magic cookie")]
    BadMagicCookie,

    /// An option, header field or the outgoing buffer itself would not fit
    /// in the representable range (e.g. an option value longer than 255
    /// bytes, or a message that overflows `u16`).
    #[error("value does not fit the wire format")]
    Overflow,
}
