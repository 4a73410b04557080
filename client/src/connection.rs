//! The dual-socket connection state machine.
//!
//! A connection owns at most one packet socket and one UDP socket at a
//! time, plus — during the hand-off between the two — both at once. The
//! lifecycle is expressed as a tagged enum rather than two optional fields
//! with a runtime assertion that exactly one is set, so an invalid
//! combination is unrepresentable instead of merely disallowed.

use std::net::Ipv4Addr;

use dhcp4_proto::constants::{option_tag, HTYPE_INFINIBAND, SIZE_HARDWARE_ADDRESS};
use dhcp4_proto::{IncomingMessage, UDP_MAX_SIZE};
use log::{debug, trace, warn};

use crate::builder::MessageBuilder;
use crate::error::ConnectionError;
use crate::socket::{PacketSocket, SocketFactory, UdpTransport};

/// The single token every socket this crate registers uses. `spec.md`'s
/// readiness notifier only ever needs to distinguish "this connection has
/// something to read" from everything else a caller's event loop also
/// polls; which of the two sockets fired is determined by `dispatch`
/// itself, not by the token.
pub const CONNECTION_TOKEN: mio::Token = mio::Token(0xD4C9);

enum State<P, U> {
    Init,
    Packet { raw: P },
    Draining { raw: P, udp: U },
    Udp { udp: U },
}

impl<P, U> State<P, U> {
    fn name(&self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::Packet { .. } => "PACKET",
            State::Draining { .. } => "DRAINING",
            State::Udp { .. } => "UDP",
        }
    }
}

/// Configuration needed to construct a [`Connection`]. Owned by the
/// caller; nothing here is mutated once `Connection::new` returns.
pub struct ConnectionConfig {
    pub ifindex: i32,
    pub htype: u8,
    pub hlen: u8,
    pub chaddr: [u8; SIZE_HARDWARE_ADDRESS],
    /// Broadcast hardware address to use on the link (`ff:ff:ff:ff:ff:ff`
    /// on Ethernet).
    pub bhaddr: [u8; SIZE_HARDWARE_ADDRESS],
    /// DHCP client-identifier option value. `len() == 1` is rejected:
    /// length 0 already means "no identifier", so length 1 is reserved
    /// rather than ambiguous.
    pub client_id: Vec<u8>,
    /// Forces the BROADCAST flag on every outgoing message, for clients
    /// that cannot process a unicast reply before their IP stack is
    /// configured. Forced `true` automatically for InfiniBand.
    pub request_broadcast: bool,
    /// Path MTU hint used for `Maximum Message Size` while no UDP socket
    /// exists yet (state ∈ {INIT, PACKET}). `0` omits the option.
    pub mtu: u16,
}

/// A DHCPv4 client transport and message factory bound to one interface.
pub struct Connection<'a, F: SocketFactory> {
    poll: &'a mio::Poll,
    factory: F,
    state: State<F::Packet, F::Udp>,

    ifindex: i32,
    htype: u8,
    hlen: u8,
    chaddr: [u8; SIZE_HARDWARE_ADDRESS],
    bhaddr: [u8; SIZE_HARDWARE_ADDRESS],
    /// How many leading bytes of `bhaddr` are meaningful. Tracked
    /// separately from `hlen`: InfiniBand forces `hlen` to zero on the
    /// wire (`chaddr` is suppressed) but a broadcast send still needs a
    /// link-layer destination address of some length.
    bhaddr_len: u8,
    /// False once hardware-type canonicalization (InfiniBand) decides the
    /// wire `chaddr` cannot carry useful information.
    send_chaddr: bool,
    request_broadcast: bool,
    client_id: Vec<u8>,
    mtu: u16,

    ciaddr: Ipv4Addr,
    siaddr: Ipv4Addr,
}

impl<'a, F: SocketFactory> Connection<'a, F> {
    /// Builds a connection in the `INIT` state. Canonicalizes hardware
    /// parameters for link types whose address does not fit `chaddr`:
    /// InfiniBand (`htype` 32) carries a 20-byte address, so `hlen` and
    /// `chaddr` are forced to zero and `chaddr` is omitted from every
    /// outgoing message, matching RFC 4390's reliance on the broadcast
    /// flag instead of link-layer addressing.
    pub fn new(poll: &'a mio::Poll, factory: F, config: ConnectionConfig) -> Result<Self, ConnectionError> {
        if config.client_id.len() == 1 {
            return Err(ConnectionError::InvalidConfig(
                "client identifier length of 1 is reserved",
            ));
        }

        let htype = config.htype;
        let mut hlen = config.hlen;
        let mut chaddr = config.chaddr;
        let mut send_chaddr = true;
        let mut request_broadcast = config.request_broadcast;
        let bhaddr_len = config.hlen.min(SIZE_HARDWARE_ADDRESS as u8);

        if htype == HTYPE_INFINIBAND {
            hlen = 0;
            chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
            send_chaddr = false;
            request_broadcast = true;
        } else if hlen as usize > SIZE_HARDWARE_ADDRESS {
            return Err(ConnectionError::InvalidConfig(
                "hardware address length exceeds 16 bytes",
            ));
        }

        Ok(Connection {
            poll,
            factory,
            state: State::Init,
            ifindex: config.ifindex,
            htype,
            hlen,
            chaddr,
            bhaddr: config.bhaddr,
            bhaddr_len,
            send_chaddr,
            request_broadcast,
            client_id: config.client_id,
            mtu: config.mtu,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
        })
    }

    fn builder(&self) -> MessageBuilder {
        MessageBuilder {
            htype: self.htype,
            hlen: self.hlen,
            chaddr: self.chaddr,
            send_chaddr: self.send_chaddr,
            request_broadcast: self.request_broadcast,
            client_id: self.client_id.clone(),
        }
    }

    /// `Maximum Message Size` to advertise for the current state: the
    /// configured MTU hint before a UDP socket exists (omitted if the hint
    /// is `0`), or the fixed kernel-deliverable ceiling once it does.
    fn effective_max_message_size(&self) -> Option<u16> {
        match &self.state {
            State::Init | State::Packet { .. } => {
                if self.mtu == 0 {
                    None
                } else {
                    Some(self.mtu)
                }
            }
            State::Draining { .. } | State::Udp { .. } => Some(UDP_MAX_SIZE),
        }
    }

    fn require_state(&self, expected: &'static str, ok: bool) -> Result<(), ConnectionError> {
        if ok {
            Ok(())
        } else {
            Err(ConnectionError::WrongState {
                expected,
                actual: self.state.name(),
            })
        }
    }

    /// `INIT -> PACKET`. Opens the raw packet socket and registers it with
    /// the readiness notifier.
    pub fn listen(&mut self) -> Result<(), ConnectionError> {
        self.require_state("INIT", matches!(self.state, State::Init))?;
        let mut raw = self.factory.make_packet(self.ifindex)?;
        raw.register(self.poll.registry(), CONNECTION_TOKEN)?;
        debug!("listening on packet socket (ifindex {})", self.ifindex);
        self.state = State::Packet { raw };
        Ok(())
    }

    /// `PACKET -> DRAINING`. Opens the UDP socket once an address has been
    /// obtained, while keeping the packet socket alive so a reply already
    /// queued on it is not lost. Records `ciaddr := client`, `siaddr :=
    /// server` for the phases that follow (`renew`, `rebind`, `release`).
    pub fn connect(&mut self, client: Ipv4Addr, server: Ipv4Addr) -> Result<(), ConnectionError> {
        let State::Packet { raw } = std::mem::replace(&mut self.state, State::Init) else {
            let actual = self.state.name();
            self.state = State::Init;
            return Err(ConnectionError::WrongState {
                expected: "PACKET",
                actual,
            });
        };

        let udp = match self.factory.make_udp(client, server) {
            Ok(mut udp) => match udp.register(self.poll.registry(), CONNECTION_TOKEN) {
                Ok(()) => udp,
                Err(e) => {
                    self.state = State::Packet { raw };
                    return Err(e.into());
                }
            },
            Err(e) => {
                self.state = State::Packet { raw };
                return Err(e.into());
            }
        };

        self.ciaddr = client;
        self.siaddr = server;
        debug!("connected, draining packet socket before switching to udp");
        self.state = State::Draining { raw, udp };
        Ok(())
    }

    /// Reads one datagram appropriate to the current state, parses it,
    /// validates its identity, and returns it if both succeed. Malformed
    /// datagrams and replies addressed to someone else are dropped
    /// silently (logged at `trace!`/`debug!`, never surfaced as errors).
    /// Returns `Ok(None)` both when nothing was pending and when something
    /// was read but dropped.
    ///
    /// In `DRAINING`, the packet socket is always tried first so replies
    /// already queued on it surface before anything read off the UDP
    /// socket — the sole purpose of the intermediate state. Once the
    /// packet socket has nothing left to offer (`WouldBlock`), it is
    /// deregistered and closed and the connection moves to `UDP` before
    /// falling through to read the UDP socket in the same call.
    pub fn dispatch(&mut self, buf: &mut [u8]) -> Result<Option<IncomingMessage>, ConnectionError> {
        match &mut self.state {
            State::Init => Err(ConnectionError::WrongState {
                expected: "PACKET, DRAINING or UDP",
                actual: "INIT",
            }),
            State::Packet { raw } => match recv_or_none(raw.recv(buf))? {
                Some(n) => Ok(self.accept(&buf[..n])),
                None => Ok(None),
            },
            State::Draining { raw, .. } => {
                if let Some(n) = recv_or_none(raw.recv(buf))? {
                    return Ok(self.accept(&buf[..n]));
                }
                self.finish_drain()?;
                let State::Udp { udp } = &mut self.state else {
                    unreachable!("finish_drain always leaves the connection in UDP");
                };
                match recv_or_none(udp.recv(buf))? {
                    Some(n) => Ok(self.accept(&buf[..n])),
                    None => Ok(None),
                }
            }
            State::Udp { udp } => match recv_or_none(udp.recv(buf))? {
                Some(n) => Ok(self.accept(&buf[..n])),
                None => Ok(None),
            },
        }
    }

    /// `DRAINING -> UDP`. Deregisters and drops the packet socket once it
    /// has no more queued replies to offer.
    fn finish_drain(&mut self) -> Result<(), ConnectionError> {
        let State::Draining { mut raw, udp } = std::mem::replace(&mut self.state, State::Init) else {
            unreachable!("finish_drain called outside DRAINING");
        };
        raw.deregister(self.poll.registry())?;
        drop(raw);
        debug!("packet socket drained, switched to udp only");
        self.state = State::Udp { udp };
        Ok(())
    }

    fn accept(&self, bytes: &[u8]) -> Option<IncomingMessage> {
        let message = match IncomingMessage::parse(bytes) {
            Ok(message) => message,
            Err(error) => {
                trace!("dropping unparseable datagram: {}", error);
                return None;
            }
        };

        let hlen = self.hlen as usize;
        if message.header.chaddr[..hlen] != self.chaddr[..hlen] {
            debug!("dropping reply addressed to a foreign chaddr");
            return None;
        }
        // Absent option counts as length 0, matching an empty `client_id`.
        let client_id = message.options.get(option_tag::CLIENT_IDENTIFIER).unwrap_or(&[]);
        if client_id != self.client_id.as_slice() {
            debug!("dropping reply with mismatched client identifier");
            return None;
        }

        Some(message)
    }

    fn send_packet_broadcast(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        let bhaddr = self.bhaddr;
        let bhaddr_len = self.bhaddr_len;
        match &mut self.state {
            State::Packet { raw } | State::Draining { raw, .. } => {
                raw.send_broadcast(bytes, &bhaddr[..bhaddr_len as usize])?;
                Ok(())
            }
            other => Err(ConnectionError::WrongState {
                expected: "PACKET or DRAINING",
                actual: other.name(),
            }),
        }
    }

    fn send_udp_unicast(&mut self, bytes: &[u8], to: Ipv4Addr) -> Result<(), ConnectionError> {
        match &mut self.state {
            State::Udp { udp } | State::Draining { udp, .. } => {
                udp.send_unicast(bytes, to)?;
                Ok(())
            }
            other => Err(ConnectionError::WrongState {
                expected: "UDP or DRAINING",
                actual: other.name(),
            }),
        }
    }

    fn send_udp_broadcast(&mut self, bytes: &[u8]) -> Result<(), ConnectionError> {
        match &mut self.state {
            State::Udp { udp } | State::Draining { udp, .. } => {
                udp.send_broadcast(bytes)?;
                Ok(())
            }
            other => Err(ConnectionError::WrongState {
                expected: "UDP or DRAINING",
                actual: other.name(),
            }),
        }
    }

    /// Starts a new exchange with a DHCPDISCOVER. Requires `PACKET` (no
    /// address yet, so the reply must be captured on the raw socket).
    pub fn discover(&mut self, xid: u32, secs: u16) -> Result<(), ConnectionError> {
        let mms = self.effective_max_message_size();
        let message = self.builder().discover(xid, secs, mms);
        let bytes = message.to_bytes()?;
        self.send_packet_broadcast(&bytes)
    }

    /// Continues the exchange started by `discover` with a DHCPREQUEST
    /// accepting `offered_ip` from `server_id`. RFC 2131 requires this
    /// request to reuse the DISCOVER's transaction id.
    pub fn select(&mut self, xid: u32, secs: u16, offered_ip: Ipv4Addr, server_id: Ipv4Addr) -> Result<(), ConnectionError> {
        let mms = self.effective_max_message_size();
        let message = self.builder().select(xid, secs, offered_ip, server_id, mms);
        let bytes = message.to_bytes()?;
        self.send_packet_broadcast(&bytes)
    }

    /// Starts a fresh exchange re-confirming a remembered lease without an
    /// offer to select (INIT-REBOOT).
    pub fn reboot(&mut self, xid: u32, secs: u16, requested_ip: Ipv4Addr) -> Result<(), ConnectionError> {
        let mms = self.effective_max_message_size();
        let message = self.builder().reboot(xid, secs, requested_ip, mms);
        let bytes = message.to_bytes()?;
        self.send_packet_broadcast(&bytes)
    }

    /// Unicasts a renewal request to the lease's server. Requires `UDP`
    /// (or `DRAINING`, while the switch to it is still settling).
    pub fn renew(&mut self, xid: u32, secs: u16) -> Result<(), ConnectionError> {
        let mms = self.effective_max_message_size();
        let message = self.builder().renew(xid, secs, self.ciaddr, mms);
        let bytes = message.to_bytes()?;
        self.send_udp_unicast(&bytes, self.siaddr)
    }

    /// Broadcasts a renewal request once the original server is presumed
    /// unreachable.
    pub fn rebind(&mut self, xid: u32, secs: u16) -> Result<(), ConnectionError> {
        let mms = self.effective_max_message_size();
        let message = self.builder().rebind(xid, secs, self.ciaddr, mms);
        let bytes = message.to_bytes()?;
        self.send_udp_broadcast(&bytes)
    }

    /// Reports `declined_ip`, offered by `server_id`, as already in use.
    pub fn decline(
        &mut self,
        xid: u32,
        secs: u16,
        declined_ip: Ipv4Addr,
        server_id: Ipv4Addr,
        error: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let message = self.builder().decline(xid, secs, declined_ip, server_id, error);
        let bytes = message.to_bytes()?;
        self.send_packet_broadcast(&bytes)
    }

    /// Requests configuration parameters for an address held out of band.
    pub fn inform(&mut self, xid: u32, secs: u16, ciaddr: Ipv4Addr) -> Result<(), ConnectionError> {
        self.ciaddr = ciaddr;
        let mms = self.effective_max_message_size();
        let message = self.builder().inform(xid, secs, ciaddr, mms);
        let bytes = message.to_bytes()?;
        self.send_udp_unicast(&bytes, self.siaddr)
    }

    /// Relinquishes the currently held lease back to the bound server.
    pub fn release(&mut self, xid: u32, secs: u16, error: Option<&str>) -> Result<(), ConnectionError> {
        let message = self.builder().release(xid, secs, self.ciaddr, self.siaddr, error);
        let bytes = message.to_bytes()?;
        self.send_udp_unicast(&bytes, self.siaddr)
    }

    /// Teardown: deregisters every socket this connection currently holds
    /// from the readiness notifier, in LIFO registration order, then drops
    /// them (closing the underlying descriptors). Resets to the zeroed
    /// `INIT` form. Safe to call from any state, including `INIT` itself.
    pub fn close(&mut self) {
        let registry = self.poll.registry();
        match std::mem::replace(&mut self.state, State::Init) {
            State::Init => {}
            State::Packet { mut raw } => {
                if let Err(e) = raw.deregister(registry) {
                    warn!("failed to deregister packet socket during close: {}", e);
                }
            }
            State::Draining { mut raw, mut udp } => {
                if let Err(e) = udp.deregister(registry) {
                    warn!("failed to deregister udp socket during close: {}", e);
                }
                if let Err(e) = raw.deregister(registry) {
                    warn!("failed to deregister packet socket during close: {}", e);
                }
            }
            State::Udp { mut udp } => {
                if let Err(e) = udp.deregister(registry) {
                    warn!("failed to deregister udp socket during close: {}", e);
                }
            }
        }
        self.ciaddr = Ipv4Addr::UNSPECIFIED;
        self.siaddr = Ipv4Addr::UNSPECIFIED;
        debug!("connection closed, reset to init");
    }
}

impl<'a, F: SocketFactory> Drop for Connection<'a, F> {
    fn drop(&mut self) {
        self.close();
    }
}

fn recv_or_none(result: std::io::Result<usize>) -> Result<Option<usize>, ConnectionError> {
    match result {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::fake::FakeSocketFactory;
    use dhcp4_proto::constants::{message_type, op, option_tag};
    use dhcp4_proto::{Header, OutgoingMessage};

    fn test_poll() -> mio::Poll {
        mio::Poll::new().unwrap()
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            ifindex: 1,
            htype: 1,
            hlen: 6,
            chaddr: {
                let mut c = [0u8; SIZE_HARDWARE_ADDRESS];
                c[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
                c
            },
            bhaddr: [0xffu8; SIZE_HARDWARE_ADDRESS],
            client_id: vec![],
            request_broadcast: false,
            mtu: 0,
        }
    }

    fn reply_bytes(xid: u32, chaddr: [u8; SIZE_HARDWARE_ADDRESS]) -> Vec<u8> {
        let mut header = Header::zeroed();
        header.op = op::BOOTREPLY;
        header.xid = xid;
        header.chaddr = chaddr;
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPOFFER)
            .unwrap();
        message.to_bytes().unwrap()
    }

    #[test]
    fn listen_opens_the_packet_socket_and_rejects_double_listen() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        let err = connection.listen().unwrap_err();
        assert!(matches!(err, ConnectionError::WrongState { .. }));
    }

    #[test]
    fn discover_before_listen_is_a_contract_violation() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        let err = connection.discover(1, 1).unwrap_err();
        assert!(matches!(err, ConnectionError::WrongState { .. }));
    }

    #[test]
    fn close_resets_a_draining_connection_to_init() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection
            .connect(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();

        connection.close();

        assert_eq!(connection.ciaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(connection.siaddr, Ipv4Addr::UNSPECIFIED);
        // INIT again: listen succeeds instead of returning WrongState.
        connection.listen().unwrap();
    }

    #[test]
    fn close_from_init_is_a_no_op() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.close();
        connection.listen().unwrap();
    }

    #[test]
    fn client_identifier_length_of_one_is_rejected() {
        let poll = test_poll();
        let mut config = test_config();
        config.client_id = vec![0x42];
        let err = Connection::new(&poll, FakeSocketFactory, config).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidConfig(_)));
    }

    #[test]
    fn hardware_address_length_over_sixteen_is_rejected() {
        let poll = test_poll();
        let mut config = test_config();
        config.hlen = 17;
        let err = Connection::new(&poll, FakeSocketFactory, config).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidConfig(_)));
    }

    /// End-to-end scenario 1 from `spec.md` §8: happy path from INIT to a
    /// DISCOVER with no identifier, no MTU hint and no broadcast flag.
    #[test]
    fn happy_path_discover_matches_literal_scenario() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(0xDEADBEEF, 1).unwrap();

        let State::Packet { raw } = &connection.state else {
            panic!("expected PACKET state");
        };
        assert_eq!(raw.broadcast_out.len(), 1);
        let parsed = IncomingMessage::parse(&raw.broadcast_out[0]).unwrap();
        assert_eq!(parsed.header.xid, 0xDEADBEEF);
        assert_eq!(parsed.header.secs, 1);
        assert_eq!(
            parsed.options.get_u8(option_tag::DHCP_MESSAGE_TYPE),
            Some(message_type::DHCPDISCOVER)
        );
        assert_eq!(parsed.options.get(option_tag::CLIENT_IDENTIFIER), None);
        assert_eq!(parsed.options.get(option_tag::MAX_MESSAGE_SIZE), None);
        assert_eq!(parsed.header.flags, 0);
        assert_eq!(&parsed.header.chaddr[..6], &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert_eq!(parsed.header.hlen, 6);
    }

    #[test]
    fn dispatch_drops_replies_with_foreign_chaddr() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(0xaaaa, 1).unwrap();

        let foreign = [0xff; SIZE_HARDWARE_ADDRESS];
        let frame = reply_bytes(0xaaaa, foreign);
        let State::Packet { raw } = &mut connection.state else {
            panic!("expected PACKET state");
        };
        raw.inbox.push_back(frame);

        let mut buf = [0u8; 1024];
        let result = connection.dispatch(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn dispatch_drops_replies_with_mismatched_client_identifier() {
        let poll = test_poll();
        let mut config = test_config();
        config.client_id = vec![0x02, 0xaa, 0xbb];
        let mut connection = Connection::new(&poll, FakeSocketFactory, config).unwrap();
        connection.listen().unwrap();
        connection.discover(0xaaaa, 1).unwrap();

        let mut chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let mut header = Header::zeroed();
        header.op = op::BOOTREPLY;
        header.xid = 0xaaaa;
        header.chaddr = chaddr;
        let mut message = OutgoingMessage::new(header);
        message
            .options
            .append_u8(option_tag::DHCP_MESSAGE_TYPE, message_type::DHCPOFFER)
            .unwrap();
        message
            .options
            .append_bytes(option_tag::CLIENT_IDENTIFIER, &[0x02, 0xcc, 0xdd])
            .unwrap();
        let frame = message.to_bytes().unwrap();

        let State::Packet { raw } = &mut connection.state else {
            panic!("expected PACKET state");
        };
        raw.inbox.push_back(frame);

        let mut buf = [0u8; 1024];
        let result = connection.dispatch(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn dispatch_accepts_matching_reply() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(0xbbbb, 1).unwrap();

        let mut chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let frame = reply_bytes(0xbbbb, chaddr);
        let State::Packet { raw } = &mut connection.state else {
            panic!("expected PACKET state");
        };
        raw.inbox.push_back(frame);

        let mut buf = [0u8; 1024];
        let result = connection.dispatch(&mut buf).unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn infiniband_hardware_type_canonicalizes_to_zeroed_chaddr_and_broadcast() {
        let poll = test_poll();
        let mut config = test_config();
        config.htype = HTYPE_INFINIBAND;
        config.hlen = 20;
        config.chaddr = [0x42; SIZE_HARDWARE_ADDRESS];
        config.request_broadcast = false;

        let mut connection = Connection::new(&poll, FakeSocketFactory, config).unwrap();
        connection.listen().unwrap();
        connection.discover(7, 1).unwrap();

        let State::Packet { raw } = &connection.state else {
            panic!("expected PACKET state");
        };
        let parsed = IncomingMessage::parse(&raw.broadcast_out[0]).unwrap();
        assert_eq!(parsed.header.hlen, 0);
        assert_eq!(parsed.header.chaddr, [0u8; SIZE_HARDWARE_ADDRESS]);
        assert_eq!(
            parsed.header.flags & dhcp4_proto::constants::FLAG_BROADCAST,
            dhcp4_proto::constants::FLAG_BROADCAST
        );
    }

    /// Scenario 3: SELECT carries the offer as REQUESTED_IP_ADDRESS and
    /// the offering server as SERVER_IDENTIFIER, `ciaddr` stays zero.
    #[test]
    fn select_carries_requested_ip_and_server_id_not_ciaddr() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(1, 1).unwrap();
        connection
            .select(1, 2, Ipv4Addr::new(192, 0, 2, 10), Ipv4Addr::new(192, 0, 2, 1))
            .unwrap();

        let State::Packet { raw } = &connection.state else {
            panic!("expected PACKET state");
        };
        let parsed = IncomingMessage::parse(&raw.broadcast_out[1]).unwrap();
        assert_eq!(parsed.header.ciaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            parsed.options.get_ipv4(option_tag::REQUESTED_IP_ADDRESS),
            Some(Ipv4Addr::new(192, 0, 2, 10))
        );
        assert_eq!(
            parsed.options.get_ipv4(option_tag::SERVER_IDENTIFIER),
            Some(Ipv4Addr::new(192, 0, 2, 1))
        );
    }

    /// Scenario 4: RENEW goes out over UDP unicast with `ciaddr` set and
    /// neither REQUESTED_IP_ADDRESS nor SERVER_IDENTIFIER present.
    #[test]
    fn connect_then_renew_uses_udp_unicast() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(1, 1).unwrap();
        connection
            .connect(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        connection.renew(2, 5).unwrap();

        let State::Draining { udp, .. } = &connection.state else {
            panic!("expected DRAINING state");
        };
        assert_eq!(udp.unicast_out.len(), 1);
        let (bytes, to) = &udp.unicast_out[0];
        assert_eq!(*to, Ipv4Addr::new(10, 0, 0, 1));
        let parsed = IncomingMessage::parse(bytes).unwrap();
        assert_eq!(parsed.header.ciaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(parsed.options.get(option_tag::REQUESTED_IP_ADDRESS), None);
        assert_eq!(parsed.options.get(option_tag::SERVER_IDENTIFIER), None);
        assert_eq!(
            parsed.options.get_u16(option_tag::MAX_MESSAGE_SIZE),
            Some(UDP_MAX_SIZE)
        );
    }

    /// Scenario 5: REBIND broadcasts over UDP with `ciaddr` set and no
    /// SERVER_IDENTIFIER.
    #[test]
    fn connect_then_rebind_uses_udp_broadcast() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(1, 1).unwrap();
        connection
            .connect(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        connection.rebind(8, 30).unwrap();

        let State::Draining { udp, .. } = &connection.state else {
            panic!("expected DRAINING state");
        };
        assert_eq!(udp.broadcast_out.len(), 1);
        let parsed = IncomingMessage::parse(&udp.broadcast_out[0]).unwrap();
        assert_eq!(parsed.header.ciaddr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(parsed.options.get(option_tag::SERVER_IDENTIFIER), None);
    }

    /// Boundary behavior: `dispatch` in DRAINING returns the packet-socket
    /// message before any UDP-sourced one, and `pfd` is gone afterward.
    #[test]
    fn draining_dispatch_orders_packet_before_udp_then_drops_packet_socket() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(1, 1).unwrap();
        connection
            .connect(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();

        let mut chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let late_offer = reply_bytes(1, chaddr);
        let ack = reply_bytes(1, chaddr);

        let State::Draining { raw, udp } = &mut connection.state else {
            panic!("expected DRAINING state");
        };
        raw.inbox.push_back(late_offer);
        udp.inbox.push_back(ack);

        let mut buf = [0u8; 1024];
        let first = connection.dispatch(&mut buf).unwrap();
        assert!(first.is_some());
        assert!(matches!(connection.state, State::Draining { .. }));

        let second = connection.dispatch(&mut buf).unwrap();
        assert!(second.is_some());
        assert!(matches!(connection.state, State::Udp { .. }));
    }

    #[test]
    fn release_after_binding_uses_stored_server_and_address() {
        let poll = test_poll();
        let mut connection = Connection::new(&poll, FakeSocketFactory, test_config()).unwrap();
        connection.listen().unwrap();
        connection.discover(1, 1).unwrap();
        connection
            .connect(Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(10, 0, 0, 1))
            .unwrap();
        connection.release(9, 1, Some("bye")).unwrap();

        let State::Draining { udp, .. } = &connection.state else {
            panic!("expected DRAINING state");
        };
        let (bytes, to) = &udp.unicast_out[0];
        assert_eq!(*to, Ipv4Addr::new(10, 0, 0, 1));
        let parsed = IncomingMessage::parse(bytes).unwrap();
        assert_eq!(
            parsed.options.get_ipv4(option_tag::SERVER_IDENTIFIER),
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(parsed.options.get(option_tag::MESSAGE), Some(b"bye\0".as_slice()));
    }
}
