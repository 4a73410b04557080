//! Errors the transport and connection layers can report.

use thiserror::Error;

/// Failure modes of [`crate::connection::Connection`] and the socket layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// A configuration value handed to `Connection::new` cannot be used to
    /// open a socket pair (e.g. an empty interface name).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A socket syscall failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A caller invoked an operation this lifecycle state does not support.
    /// Reaching this indicates a bug in the caller: every public entry
    /// point documents the states it requires.
    #[error("operation requires {expected} state, connection is in {actual} state")]
    WrongState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The wire codec could not encode an otherwise well-formed message,
    /// e.g. an option value longer than 255 bytes.
    #[error(transparent)]
    Encode(#[from] dhcp4_proto::ParseError),
}
