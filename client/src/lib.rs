//! DHCPv4 client transport and message factory.
//!
//! Owns the dual-socket (raw packet + UDP) lifecycle, validates and
//! dispatches inbound messages, and builds the eight client-phase
//! outgoing messages (discover, select, reboot, renew, rebind, decline,
//! inform, release). Retransmission timing, lease accounting and full
//! DHCP option parsing are left to the caller.

pub mod builder;
pub mod connection;
pub mod error;
pub mod socket;

pub use connection::{Connection, ConnectionConfig, CONNECTION_TOKEN};
pub use error::ConnectionError;
