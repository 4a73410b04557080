//! Message parsing and serialization.
//!
//! The teacher's serializer/deserializer pair walks the buffer with a
//! `bytes::Buf`/`BufMut` cursor. This crate's wire layout is small and
//! fixed enough that plain slice indexing reads just as clearly, so the
//! cursor machinery (and the `nom`-flavoured error plumbing that came with
//! it) is not carried over.

use std::convert::TryInto;
use std::net::Ipv4Addr;

use crate::constants::{
    option_tag, MAGIC_COOKIE, OFFSET_MAGIC_COOKIE, OFFSET_OPTIONS, SIZE_BOOT_FILENAME,
    SIZE_HARDWARE_ADDRESS, SIZE_OPTIONS_PRIMARY, SIZE_SERVER_NAME,
};
use crate::error::ParseError;
use crate::header::Header;
use crate::options::{Options, Overload};

/// A message received off the wire, not yet interpreted by the connection
/// layer (identity and phase checks happen there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub header: Header,
    pub options: Options,
}

/// A message under construction, about to be handed to a transport for
/// transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub header: Header,
    pub options: Options,
}

impl IncomingMessage {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < OFFSET_OPTIONS {
            return Err(ParseError::Truncated);
        }

        let op = buf[0];
        let htype = buf[1];
        let hlen = buf[2];
        let hops = buf[3];
        let xid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let secs = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let ciaddr = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let yiaddr = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        let siaddr = Ipv4Addr::new(buf[20], buf[21], buf[22], buf[23]);
        let giaddr = Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]);

        let mut chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
        chaddr.copy_from_slice(&buf[28..28 + SIZE_HARDWARE_ADDRESS]);

        let sname_start = 28 + SIZE_HARDWARE_ADDRESS;
        let file_start = sname_start + SIZE_SERVER_NAME;
        let sname = buf[sname_start..file_start].to_vec();
        let file = buf[file_start..file_start + SIZE_BOOT_FILENAME].to_vec();

        let cookie = u32::from_be_bytes(
            buf[OFFSET_MAGIC_COOKIE..OFFSET_MAGIC_COOKIE + 4]
                .try_into()
                .unwrap(),
        );
        if cookie != MAGIC_COOKIE {
            return Err(ParseError::BadMagicCookie);
        }

        let mut options = Options::new();
        let overload = parse_tlv(&buf[OFFSET_OPTIONS..], &mut options)?;
        if overload.contains(Overload::FILE) {
            parse_tlv(&file, &mut options)?;
        }
        if overload.contains(Overload::SNAME) {
            parse_tlv(&sname, &mut options)?;
        }

        let header = Header {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
        };
        Ok(IncomingMessage { header, options })
    }
}

/// Walks a single TLV region, collecting options into `options` and
/// reporting which overload regions it asked the caller to also parse.
fn parse_tlv(buf: &[u8], options: &mut Options) -> Result<Overload, ParseError> {
    let mut overload = Overload::NONE;
    let mut i = 0;
    while i < buf.len() {
        let tag = buf[i];
        if tag == option_tag::END {
            break;
        }
        if tag == option_tag::PAD {
            i += 1;
            continue;
        }
        if i + 1 >= buf.len() {
            return Err(ParseError::Truncated);
        }
        let len = buf[i + 1] as usize;
        if i + 2 + len > buf.len() {
            return Err(ParseError::Truncated);
        }
        let value = buf[i + 2..i + 2 + len].to_vec();
        if tag == option_tag::OPTION_OVERLOAD && len == 1 {
            overload |= Overload::from(value[0]);
        }
        options.append(tag, value)?;
        i += 2 + len;
    }
    Ok(overload)
}

impl OutgoingMessage {
    pub fn new(header: Header) -> Self {
        OutgoingMessage {
            header,
            options: Options::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut buf = Vec::new();
        buf.push(self.header.op);
        buf.push(self.header.htype);
        buf.push(self.header.hlen);
        buf.push(self.header.hops);
        buf.extend_from_slice(&self.header.xid.to_be_bytes());
        buf.extend_from_slice(&self.header.secs.to_be_bytes());
        buf.extend_from_slice(&self.header.flags.to_be_bytes());
        buf.extend_from_slice(&self.header.ciaddr.octets());
        buf.extend_from_slice(&self.header.yiaddr.octets());
        buf.extend_from_slice(&self.header.siaddr.octets());
        buf.extend_from_slice(&self.header.giaddr.octets());
        buf.extend_from_slice(&self.header.chaddr);

        let (primary, sname, file) = place_options(&self.options, &self.header.sname, &self.header.file)?;
        buf.extend_from_slice(&sname);
        buf.extend_from_slice(&file);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&primary);

        Ok(buf)
    }
}

/// Lays `options` out across the primary area and, if it overflows, the
/// `file` then `sname` regions, returning the three byte regions ready to
/// be concatenated onto the fixed header.
///
/// Entries are packed whole: a tag/length/value never gets split across a
/// region boundary, since a parser re-reading `file` or `sname` on its own
/// needs each to be a self-contained, `END`-terminated TLV stream.
fn place_options(
    options: &Options,
    header_sname: &[u8],
    header_file: &[u8],
) -> Result<(Vec<u8>, [u8; SIZE_SERVER_NAME], [u8; SIZE_BOOT_FILENAME]), ParseError> {
    let mut sname = [0u8; SIZE_SERVER_NAME];
    let mut file = [0u8; SIZE_BOOT_FILENAME];

    if options.fits_primary_area() {
        let copy_len = header_sname.len().min(SIZE_SERVER_NAME);
        sname[..copy_len].copy_from_slice(&header_sname[..copy_len]);
        let copy_len = header_file.len().min(SIZE_BOOT_FILENAME);
        file[..copy_len].copy_from_slice(&header_file[..copy_len]);
        return Ok((encode_tlv(options)?, sname, file));
    }

    let entries: Vec<Vec<u8>> = options
        .iter()
        .map(|(tag, value)| {
            if value.len() > u8::MAX as usize {
                return Err(ParseError::Overflow);
            }
            let mut entry = Vec::with_capacity(2 + value.len());
            entry.push(*tag);
            entry.push(value.len() as u8);
            entry.extend_from_slice(value);
            Ok(entry)
        })
        .collect::<Result<_, ParseError>>()?;

    let reserved_for_overload_tag = 3;
    let primary_budget = SIZE_OPTIONS_PRIMARY - reserved_for_overload_tag - 1;
    let file_budget = SIZE_BOOT_FILENAME - 1;
    let sname_budget = SIZE_SERVER_NAME - 1;

    let mut remaining = entries.as_slice();
    let mut primary_payload = Vec::new();
    let mut used = 0;
    while let Some(entry) = remaining.first() {
        if used + entry.len() > primary_budget {
            break;
        }
        used += entry.len();
        primary_payload.extend_from_slice(entry);
        remaining = &remaining[1..];
    }

    let mut overload = Overload::NONE;

    if !remaining.is_empty() {
        let mut used = 0;
        let mut file_payload = Vec::new();
        while let Some(entry) = remaining.first() {
            if used + entry.len() > file_budget {
                break;
            }
            used += entry.len();
            file_payload.extend_from_slice(entry);
            remaining = &remaining[1..];
        }
        file[..file_payload.len()].copy_from_slice(&file_payload);
        file[file_payload.len()] = option_tag::END;
        overload |= Overload::FILE;
    }

    if !remaining.is_empty() {
        let mut used = 0;
        let mut sname_payload = Vec::new();
        while let Some(entry) = remaining.first() {
            if used + entry.len() > sname_budget {
                break;
            }
            used += entry.len();
            sname_payload.extend_from_slice(entry);
            remaining = &remaining[1..];
        }
        sname[..sname_payload.len()].copy_from_slice(&sname_payload);
        sname[sname_payload.len()] = option_tag::END;
        overload |= Overload::SNAME;
    }

    if !remaining.is_empty() {
        return Err(ParseError::Overflow);
    }

    let mut primary = Vec::with_capacity(primary_payload.len() + reserved_for_overload_tag + 1);
    primary.push(option_tag::OPTION_OVERLOAD);
    primary.push(1);
    primary.push(u8::from(overload));
    primary.extend_from_slice(&primary_payload);
    primary.push(option_tag::END);

    Ok((primary, sname, file))
}

fn encode_tlv(options: &Options) -> Result<Vec<u8>, ParseError> {
    let mut encoded = Vec::new();
    for (tag, value) in options.iter() {
        if value.len() > u8::MAX as usize {
            return Err(ParseError::Overflow);
        }
        encoded.push(*tag);
        encoded.push(value.len() as u8);
        encoded.extend_from_slice(value);
    }
    encoded.push(option_tag::END);
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{message_type, op};

    fn sample_header() -> Header {
        let mut header = Header::zeroed();
        header.op = op::BOOTREQUEST;
        header.htype = 1;
        header.hlen = 6;
        header.xid = 0xdead_beef;
        header.chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        header
    }

    #[test]
    fn round_trips_a_small_message() {
        let mut message = OutgoingMessage::new(sample_header());
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPDISCOVER)
            .unwrap();
        message
            .options
            .append_bytes(option_tag::PARAMETER_REQUEST_LIST, &[1, 3, 6])
            .unwrap();

        let bytes = message.to_bytes().unwrap();
        let parsed = IncomingMessage::parse(&bytes).unwrap();

        assert_eq!(parsed.header.op, op::BOOTREQUEST);
        assert_eq!(parsed.header.xid, 0xdead_beef);
        assert_eq!(
            parsed.options.get_u8(option_tag::DHCP_MESSAGE_TYPE),
            Some(message_type::DHCPDISCOVER)
        );
        assert_eq!(
            parsed.options.get(option_tag::PARAMETER_REQUEST_LIST),
            Some([1u8, 3, 6].as_slice())
        );
    }

    #[test]
    fn rejects_bad_magic_cookie() {
        let message = OutgoingMessage::new(sample_header());
        let mut bytes = message.to_bytes().unwrap();
        bytes[OFFSET_MAGIC_COOKIE] ^= 0xff;
        assert_eq!(IncomingMessage::parse(&bytes), Err(ParseError::BadMagicCookie));
    }

    #[test]
    fn rejects_truncated_buffers() {
        assert_eq!(IncomingMessage::parse(&[0u8; 10]), Err(ParseError::Truncated));
    }

    #[test]
    fn spills_into_file_and_sname_once_primary_area_is_exhausted() {
        let mut message = OutgoingMessage::new(sample_header());
        // Plenty of long vendor-class values to blow past the 102-byte
        // primary options area and force the overload mechanism.
        for i in 0..10u8 {
            message.options.append_bytes(60, &[i; 20]).unwrap();
        }

        let bytes = message.to_bytes().unwrap();
        let parsed = IncomingMessage::parse(&bytes).unwrap();

        let values: Vec<_> = parsed
            .options
            .iter()
            .filter(|(tag, _)| *tag == 60)
            .collect();
        assert_eq!(values.len(), 10);
    }

    #[test]
    fn overload_fills_all_three_regions_right_up_to_their_budget() {
        // 11 is the most 22-byte entries (tag + len + 20-byte value) that
        // fit across the primary/file/sname budgets at once (4 + 5 + 2).
        let mut message = OutgoingMessage::new(sample_header());
        for i in 0..11u8 {
            message.options.append_bytes(60, &[i; 20]).unwrap();
        }

        let bytes = message.to_bytes().unwrap();
        let parsed = IncomingMessage::parse(&bytes).unwrap();
        let values: Vec<_> = parsed
            .options
            .iter()
            .filter(|(tag, _)| *tag == 60)
            .collect();
        assert_eq!(values.len(), 11);
    }

    #[test]
    fn overflows_when_options_exceed_all_three_regions() {
        let mut message = OutgoingMessage::new(sample_header());
        for i in 0..12u8 {
            message.options.append_bytes(60, &[i; 20]).unwrap();
        }

        assert_eq!(message.to_bytes(), Err(ParseError::Overflow));
    }
}
