//! DHCP options as an ordered tag/value list.
//!
//! The teacher's `protocol` crate models every RFC 2132 option as its own
//! typed struct field. That level of coverage is out of scope here: this
//! crate's callers only ever need a handful of tags, so options are kept
//! as a generic `(tag, bytes)` list with typed constructors layered on top
//! for the tags the message builder actually uses.

use std::net::Ipv4Addr;

use crate::constants::SIZE_OPTIONS_PRIMARY;
use crate::error::ParseError;

/// Which fixed header region(s) a message's options have spilled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Overload(u8);

impl Overload {
    pub const NONE: Overload = Overload(0);
    pub const FILE: Overload = Overload(0b01);
    pub const SNAME: Overload = Overload(0b10);

    pub fn contains(self, other: Overload) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Overload {
    type Output = Overload;

    fn bitor(self, rhs: Overload) -> Overload {
        Overload(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Overload {
    fn bitor_assign(&mut self, rhs: Overload) {
        self.0 |= rhs.0;
    }
}

impl From<u8> for Overload {
    fn from(value: u8) -> Self {
        Overload(value & 0b11)
    }
}

impl From<Overload> for u8 {
    fn from(overload: Overload) -> u8 {
        overload.0
    }
}

/// An ordered list of raw DHCP options, in the order they were appended or
/// parsed off the wire. Order matters for reproducing a specific outgoing
/// message exactly; it is irrelevant for lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    entries: Vec<(u8, Vec<u8>)>,
}

impl Options {
    pub fn new() -> Self {
        Options::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u8, Vec<u8>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a raw tag/value pair. Fails if `value` cannot be represented
    /// as a single TLV (RFC 2132 options carry a one-byte length).
    pub fn append(&mut self, tag: u8, value: Vec<u8>) -> Result<(), ParseError> {
        if value.len() > u8::MAX as usize {
            return Err(ParseError::Overflow);
        }
        self.entries.push((tag, value));
        Ok(())
    }

    pub fn append_u8(&mut self, tag: u8, value: u8) -> Result<(), ParseError> {
        self.append(tag, vec![value])
    }

    pub fn append_u16(&mut self, tag: u8, value: u16) -> Result<(), ParseError> {
        self.append(tag, value.to_be_bytes().to_vec())
    }

    pub fn append_u32(&mut self, tag: u8, value: u32) -> Result<(), ParseError> {
        self.append(tag, value.to_be_bytes().to_vec())
    }

    pub fn append_ipv4(&mut self, tag: u8, value: Ipv4Addr) -> Result<(), ParseError> {
        self.append(tag, value.octets().to_vec())
    }

    pub fn append_bytes(&mut self, tag: u8, value: &[u8]) -> Result<(), ParseError> {
        self.append(tag, value.to_vec())
    }

    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_slice())
    }

    pub fn get_u8(&self, tag: u8) -> Option<u8> {
        self.get(tag).and_then(|v| v.first().copied())
    }

    pub fn get_u16(&self, tag: u8) -> Option<u16> {
        self.get(tag)
            .and_then(|v| <[u8; 2]>::try_from(v).ok())
            .map(u16::from_be_bytes)
    }

    pub fn get_u32(&self, tag: u8) -> Option<u32> {
        self.get(tag)
            .and_then(|v| <[u8; 4]>::try_from(v).ok())
            .map(u32::from_be_bytes)
    }

    pub fn get_ipv4(&self, tag: u8) -> Option<Ipv4Addr> {
        self.get(tag)
            .and_then(|v| <[u8; 4]>::try_from(v).ok())
            .map(Ipv4Addr::from)
    }

    /// Total TLV-encoded size this options list would occupy, `END`
    /// included, before any overload spilling.
    pub(crate) fn encoded_len(&self) -> usize {
        self.entries.iter().map(|(_, v)| 2 + v.len()).sum::<usize>() + 1
    }

    pub(crate) fn fits_primary_area(&self) -> bool {
        self.encoded_len() <= SIZE_OPTIONS_PRIMARY
    }
}
