//! Outbound message construction.
//!
//! Mirrors the teacher's `MessageBuilder`: one small struct holding the
//! identity fields every outgoing message needs, with one method per
//! client phase. Generalized from the teacher's typed `Options` to the
//! generic tag/value list, and from a fixed Ethernet `MacAddress` to a
//! raw hardware address so InfiniBand's 20-byte address and its
//! all-zero-`chaddr` convention fit the same struct.

use std::net::Ipv4Addr;

use dhcp4_proto::constants::{message_type, op, option_tag, SIZE_HARDWARE_ADDRESS};
use dhcp4_proto::{Header, OutgoingMessage};

/// Identity and preference fields every message this client sends needs,
/// independent of which phase is being built. The `Maximum Message Size`
/// value is deliberately not stored here: RFC 2131 §4.3.2 has it depend on
/// whether the connection can already receive over UDP, which only
/// `Connection` (not the builder) tracks, so each phase method takes it as
/// an explicit parameter instead.
pub struct MessageBuilder {
    pub htype: u8,
    pub hlen: u8,
    pub chaddr: [u8; SIZE_HARDWARE_ADDRESS],
    /// Whether `chaddr` should be sent at all. False for InfiniBand, where
    /// the link-layer address does not fit the field and RFC 4390 has the
    /// client rely on the broadcast flag instead.
    pub send_chaddr: bool,
    /// Whether the client wants replies sent to the IP broadcast address
    /// rather than unicast to `yiaddr`. Forced `true` for InfiniBand.
    pub request_broadcast: bool,
    pub client_id: Vec<u8>,
}

impl MessageBuilder {
    /// Builds the fixed header shared by every phase. `secs` must be
    /// non-zero: some servers reject a DHCPDISCOVER/DHCPREQUEST that claims
    /// to have taken no time at all to arrive, so a caller passing zero is
    /// a contract violation rather than a value this layer should silently
    /// accept.
    fn base_header(&self, xid: u32, secs: u16, ciaddr: Ipv4Addr) -> Header {
        debug_assert!(secs != 0, "secs must be non-zero (RFC 2131 §4.4.1)");

        let mut header = Header::zeroed();
        header.op = op::BOOTREQUEST;
        header.htype = self.htype;
        header.hlen = self.hlen;
        header.xid = xid;
        header.secs = secs;
        header.ciaddr = ciaddr;
        if self.request_broadcast {
            header.flags = dhcp4_proto::constants::FLAG_BROADCAST;
        }
        if self.send_chaddr {
            header.chaddr = self.chaddr;
        }
        header
    }

    /// Options every phase that carries `Maximum Message Size` also wants:
    /// the client identifier, if configured. Shared between
    /// DISCOVER/REQUEST/INFORM, matching RFC 2131 §4.3.2's option table.
    fn append_default_options(&self, message: &mut OutgoingMessage, max_message_size: Option<u16>) {
        if let Some(size) = max_message_size {
            message
                .options
                .append_u16(option_tag::MAX_MESSAGE_SIZE, size)
                .expect("u16 option always fits");
        }
        self.append_client_id(message);
    }

    fn append_client_id(&self, message: &mut OutgoingMessage) {
        if !self.client_id.is_empty() {
            message
                .options
                .append_bytes(option_tag::CLIENT_IDENTIFIER, &self.client_id)
                .expect("client id is truncated by the caller if oversized");
        }
    }

    /// Appends a human-readable NUL-terminated error string to DECLINE or
    /// RELEASE, matching the `ERROR_MESSAGE`/`MESSAGE` option (tag 56).
    fn append_error_message(message: &mut OutgoingMessage, error: Option<&str>) {
        if let Some(text) = error {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            message
                .options
                .append_bytes(option_tag::MESSAGE, &bytes)
                .expect("error text is truncated by the caller if oversized");
        }
    }

    /// DHCPDISCOVER: no `ciaddr`, no requested address. `max_message_size`
    /// is the connection's MTU hint (state ∈ {INIT, PACKET}), omitted if 0.
    pub fn discover(&self, xid: u32, secs: u16, max_message_size: Option<u16>) -> OutgoingMessage {
        let header = self.base_header(xid, secs, Ipv4Addr::UNSPECIFIED);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPDISCOVER)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPREQUEST in SELECTING state: carries the offer being accepted as
    /// REQUESTED_IP_ADDRESS and SERVER_IDENTIFIER, `ciaddr` still zero.
    pub fn select(
        &self,
        xid: u32,
        secs: u16,
        offered_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        max_message_size: Option<u16>,
    ) -> OutgoingMessage {
        let header = self.base_header(xid, secs, Ipv4Addr::UNSPECIFIED);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPREQUEST)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::REQUESTED_IP_ADDRESS, offered_ip)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::SERVER_IDENTIFIER, server_id)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPREQUEST in INIT-REBOOT state: carries a remembered address as
    /// REQUESTED_IP_ADDRESS, no SERVER_IDENTIFIER (no offer to tie to yet).
    pub fn reboot(
        &self,
        xid: u32,
        secs: u16,
        requested_ip: Ipv4Addr,
        max_message_size: Option<u16>,
    ) -> OutgoingMessage {
        let header = self.base_header(xid, secs, Ipv4Addr::UNSPECIFIED);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPREQUEST)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::REQUESTED_IP_ADDRESS, requested_ip)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPREQUEST in RENEWING state: unicast to the lease's server,
    /// `ciaddr` set, no REQUESTED_IP_ADDRESS/SERVER_IDENTIFIER (RFC 2131
    /// §4.3.2 — both are implied by the unicast destination already).
    pub fn renew(&self, xid: u32, secs: u16, ciaddr: Ipv4Addr, max_message_size: Option<u16>) -> OutgoingMessage {
        let header = self.base_header(xid, secs, ciaddr);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPREQUEST)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPREQUEST in REBINDING state: identical body to `renew`, sent
    /// broadcast because the original server is presumed unreachable.
    pub fn rebind(&self, xid: u32, secs: u16, ciaddr: Ipv4Addr, max_message_size: Option<u16>) -> OutgoingMessage {
        let header = self.base_header(xid, secs, ciaddr);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPREQUEST)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPDECLINE: reports a duplicate address back to the offering
    /// server. No `Maximum Message Size`/parameter negotiation — a
    /// declined address is not something to renegotiate preferences over.
    pub fn decline(
        &self,
        xid: u32,
        secs: u16,
        declined_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        error: Option<&str>,
    ) -> OutgoingMessage {
        let header = self.base_header(xid, secs, Ipv4Addr::UNSPECIFIED);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPDECLINE)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::REQUESTED_IP_ADDRESS, declined_ip)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::SERVER_IDENTIFIER, server_id)
            .unwrap();
        self.append_client_id(&mut message);
        Self::append_error_message(&mut message, error);
        message
    }

    /// DHCPINFORM: sent by a host that already has an address configured
    /// out of band and only wants the rest of the option set.
    pub fn inform(&self, xid: u32, secs: u16, ciaddr: Ipv4Addr, max_message_size: Option<u16>) -> OutgoingMessage {
        let header = self.base_header(xid, secs, ciaddr);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPINFORM)
            .unwrap();
        self.append_default_options(&mut message, max_message_size);
        message
    }

    /// DHCPRELEASE: relinquishes `ciaddr` back to `server_id`.
    pub fn release(
        &self,
        xid: u32,
        secs: u16,
        ciaddr: Ipv4Addr,
        server_id: Ipv4Addr,
        error: Option<&str>,
    ) -> OutgoingMessage {
        let header = self.base_header(xid, secs, ciaddr);
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPRELEASE)
            .unwrap();
        message
            .options
            .append_ipv4(option_tag::SERVER_IDENTIFIER, server_id)
            .unwrap();
        self.append_client_id(&mut message);
        Self::append_error_message(&mut message, error);
        message
    }
}
