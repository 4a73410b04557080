//! DHCP/BOOTP message constants.

/// `chaddr` size in bytes.
pub const SIZE_HARDWARE_ADDRESS: usize = 16;

/// `sname` size in bytes.
pub const SIZE_SERVER_NAME: usize = 64;

/// `file` size in bytes.
pub const SIZE_BOOT_FILENAME: usize = 128;

/// Fixed BOOTP header size, up to and including `file`.
pub const OFFSET_OPTIONS_AREA: usize = 236;

/// DHCP options magic cookie offset in bytes.
pub const OFFSET_MAGIC_COOKIE: usize = OFFSET_OPTIONS_AREA;

/// DHCP options themselves offset in bytes.
pub const OFFSET_OPTIONS: usize = OFFSET_MAGIC_COOKIE + 4;

/// Only the highest bit of the `flags` field is used in DHCP.
pub const FLAG_BROADCAST: u16 = 0b1000000000000000;

/// The magic number before the DHCP options.
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

/// The minimal message size a client MUST be able to accept (RFC 2131 §2),
/// and the value advertised in `Maximum Message Size` once the client is
/// reachable over ordinary UDP (the kernel's UDP stack will not deliver
/// anything the client hasn't room for, so the pre-bind MTU hint is no
/// longer needed and this fixed ceiling takes over instead).
pub const UDP_MAX_SIZE: u16 = 576;

/// Primary options area before `sname`/`file` get repurposed via the
/// overload option. Past this point `Options::to_bytes` must spill into
/// `file` and then `sname`, same as a relay squeezed against
/// `UDP_MAX_SIZE` would.
pub const SIZE_OPTIONS_PRIMARY: usize = 102;

/// Well-known DHCP server port.
pub const DHCP_PORT_SERVER: u16 = 67;

/// Well-known DHCP client port.
pub const DHCP_PORT_CLIENT: u16 = 68;

/// `ARPHRD_ETHER` (the usual `htype`).
pub const HTYPE_ETHERNET: u8 = 1;

/// `ARPHRD_INFINIBAND`. Has a 20-byte link-layer address that does not fit
/// `chaddr`; RFC 4390 has senders zero `chaddr` and set the broadcast flag
/// instead of relying on unicast link-layer addressing.
pub const HTYPE_INFINIBAND: u8 = 32;

/// Tags used directly by the message builder. Not an exhaustive RFC 2132
/// option registry: only the tags this crate's callers construct or read.
pub mod option_tag {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTERS: u8 = 3;
    pub const DOMAIN_NAME_SERVERS: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const REQUESTED_IP_ADDRESS: u8 = 50;
    pub const ADDRESS_TIME: u8 = 51;
    pub const OPTION_OVERLOAD: u8 = 52;
    pub const DHCP_MESSAGE_TYPE: u8 = 53;
    pub const SERVER_IDENTIFIER: u8 = 54;
    pub const PARAMETER_REQUEST_LIST: u8 = 55;
    pub const MESSAGE: u8 = 56;
    pub const MAX_MESSAGE_SIZE: u8 = 57;
    pub const RENEWAL_TIME: u8 = 58;
    pub const REBINDING_TIME: u8 = 59;
    pub const CLASS_IDENTIFIER: u8 = 60;
    pub const CLIENT_IDENTIFIER: u8 = 61;
    pub const END: u8 = 255;
}

/// DHCP message type values carried in option 53 (RFC 2131 §3).
pub mod message_type {
    pub const DHCPDISCOVER: u8 = 1;
    pub const DHCPOFFER: u8 = 2;
    pub const DHCPREQUEST: u8 = 3;
    pub const DHCPDECLINE: u8 = 4;
    pub const DHCPACK: u8 = 5;
    pub const DHCPNAK: u8 = 6;
    pub const DHCPRELEASE: u8 = 7;
    pub const DHCPINFORM: u8 = 8;
}

/// BOOTP `op` values.
pub mod op {
    pub const BOOTREQUEST: u8 = 1;
    pub const BOOTREPLY: u8 = 2;
}
