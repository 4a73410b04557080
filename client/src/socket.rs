//! Non-blocking packet and UDP socket primitives.
//!
//! Grounded in the sibling `switchable_socket` crate's raw `AF_PACKET`
//! plumbing (`RawMioSocket`/`MakeSocket`) and in this workspace's own
//! `arp` crate for the `nix`/`libc` ioctl idiom, generalized into the two
//! traits [`PacketSocket`] and [`UdpTransport`] plus the [`SocketFactory`]
//! that builds them. A connection never constructs a socket directly; it
//! always goes through a factory, which is what lets tests run the state
//! machine against in-memory fakes instead of real interfaces.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use dhcp4_proto::{DHCP_PORT_CLIENT, DHCP_PORT_SERVER};
use log::debug;

const ETH_P_IP: libc::c_int = 0x0800;
const SIOCGIFINDEX: libc::c_ulong = 0x8933;
const IFNAMSIZ: usize = 16;

/// Reads and writes raw Ethernet frames over an `AF_PACKET` socket admitted
/// by a BPF filter that only lets DHCP/BOOTP client traffic through.
pub trait PacketSocket {
    fn as_raw_fd(&self) -> RawFd;
    /// Reads one frame. `Err(WouldBlock)` means "nothing pending".
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Broadcasts a fully-formed BOOTP message to the local segment,
    /// addressed at the link layer to `bhaddr` (the connection's configured
    /// broadcast hardware address — `ff:ff:ff:ff:ff:ff` on Ethernet).
    fn send_broadcast(&mut self, payload: &[u8], bhaddr: &[u8]) -> io::Result<()>;
    /// Registers this socket with the readiness notifier. Owned by the
    /// trait rather than a blanket `mio::event::Source` bound on
    /// `SocketFactory::Packet`, so the in-memory fakes used in tests can
    /// no-op it instead of handing a real `Poll` an invalid file descriptor.
    fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()>;
}

/// A UDP socket bound to the DHCP client port, used once the connection no
/// longer needs to capture frames addressed to an IP it doesn't hold yet.
pub trait UdpTransport {
    fn as_raw_fd(&self) -> RawFd;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn send_unicast(&mut self, payload: &[u8], to: Ipv4Addr) -> io::Result<()>;
    fn send_broadcast(&mut self, payload: &[u8]) -> io::Result<()>;
    fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()>;
    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()>;
}

/// Builds the packet and UDP sockets a connection switches between.
/// Generalizes the teacher-adjacent `MakeSocket` trait, which only ever
/// had to build one socket kind at a time, into a pair so the dual-socket
/// lifecycle's `DRAINING` state can hold both at once.
pub trait SocketFactory {
    type Packet: PacketSocket;
    type Udp: UdpTransport;

    fn make_packet(&mut self, ifindex: i32) -> io::Result<Self::Packet>;
    /// Binds to the client port and connects the socket to `server`, so
    /// every later unicast send is implicitly addressed to the same peer.
    fn make_udp(&mut self, client: Ipv4Addr, server: Ipv4Addr) -> io::Result<Self::Udp>;
}

/// Resolves an interface name to its kernel `ifindex`, needed to bind an
/// `AF_PACKET` socket to a specific link.
pub fn ifindex(iface: &str) -> io::Result<libc::c_int> {
    #[repr(C)]
    struct IfreqIndex {
        ifrn_name: [libc::c_char; IFNAMSIZ],
        ifindex: libc::c_int,
    }

    if iface.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    let mut ifreq = IfreqIndex {
        ifrn_name: [0; IFNAMSIZ],
        ifindex: 0,
    };
    for (dst, src) in ifreq.ifrn_name.iter_mut().zip(iface.bytes()) {
        *dst = src as libc::c_char;
    }

    use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

    let fd = socket(AddressFamily::Inet, SockType::Datagram, SockFlag::empty(), None)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    let ret = unsafe { libc::ioctl(fd, SIOCGIFINDEX as _, &mut ifreq) };
    let err = io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if ret != 0 {
        return Err(err);
    }
    Ok(ifreq.ifindex)
}

/// Classic BPF program admitting only UDP datagrams addressed to the DHCP
/// client port. `AF_PACKET`/`SOCK_DGRAM` sockets deliver frames with the
/// link-layer header already stripped, so offsets are relative to the IP
/// header: byte 9 is the protocol field, and the IP header length (low
/// nibble of byte 0, in 32-bit words) locates the UDP header that follows.
fn dhcp_client_bpf_program() -> Vec<libc::sock_filter> {
    const BPF_LD: u16 = 0x00;
    const BPF_LDX: u16 = 0x01;
    const BPF_JMP: u16 = 0x05;
    const BPF_RET: u16 = 0x06;
    const BPF_H: u16 = 0x08;
    const BPF_B: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_ABS: u16 = 0x20;
    const BPF_IND: u16 = 0x40;
    const BPF_MSH: u16 = 0xa0;
    const BPF_JEQ: u16 = 0x10;

    vec![
        // A = ip.protocol (offset 9)
        libc::sock_filter {
            code: BPF_LD | BPF_B | BPF_ABS,
            jt: 0,
            jf: 0,
            k: 9,
        },
        // if A != IPPROTO_UDP, skip to reject
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 4,
            k: libc::IPPROTO_UDP as u32,
        },
        // X = ip header length in bytes
        libc::sock_filter {
            code: BPF_LDX | BPF_B | BPF_MSH,
            jt: 0,
            jf: 0,
            k: 0,
        },
        // A = udp.dest_port (X + 2)
        libc::sock_filter {
            code: BPF_LD | BPF_H | BPF_IND,
            jt: 0,
            jf: 0,
            k: 2,
        },
        // if A != DHCP_PORT_CLIENT, skip to reject
        libc::sock_filter {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            jt: 0,
            jf: 1,
            k: dhcp4_proto::DHCP_PORT_CLIENT as u32,
        },
        // accept: return whole packet
        libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: 0x0004_0000,
        },
        // reject
        libc::sock_filter {
            code: BPF_RET | BPF_K,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ]
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}

/// A non-blocking `AF_PACKET`/`SOCK_DGRAM` socket bound to one interface,
/// filtered down to DHCP client traffic.
pub struct LinuxPacketSocket {
    fd: RawFd,
    ifindex: libc::c_int,
}

impl LinuxPacketSocket {
    pub fn bind(ifindex: libc::c_int) -> io::Result<Self> {
        unsafe {
            let fd = libc::socket(libc::PF_PACKET, libc::SOCK_DGRAM, (ETH_P_IP as u16).to_be() as i32);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let sockaddr = libc::sockaddr_ll {
                sll_family: libc::AF_PACKET as u16,
                sll_protocol: (ETH_P_IP as u16).to_be(),
                sll_ifindex: ifindex,
                sll_hatype: 0,
                sll_pkttype: 0,
                sll_halen: 0,
                sll_addr: [0; 8],
            };
            if libc::bind(
                fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sockaddr) as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let program = dhcp_client_bpf_program();
            let fprog = libc::sock_fprog {
                len: program.len() as u16,
                filter: program.as_ptr() as *mut libc::sock_filter,
            };
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &fprog as *const _ as *const libc::c_void,
                mem::size_of_val(&fprog) as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            set_nonblocking(fd)?;
            debug!("opened packet socket on ifindex {}", ifindex);
            Ok(LinuxPacketSocket { fd, ifindex })
        }
    }
}

impl PacketSocket for LinuxPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.fd, buf)
    }

    fn send_broadcast(&mut self, payload: &[u8], bhaddr: &[u8]) -> io::Result<()> {
        // `sockaddr_ll::sll_addr` is fixed at 8 bytes in `libc`; link types
        // with a longer broadcast address (InfiniBand's is 20 bytes) get
        // truncated to the leading 8. Ethernet's 6-byte address fits exactly.
        let len = bhaddr.len().min(8);
        let mut sll_addr = [0u8; 8];
        sll_addr[..len].copy_from_slice(&bhaddr[..len]);
        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (ETH_P_IP as u16).to_be(),
            sll_ifindex: self.ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: len as u8,
            sll_addr,
        };
        let ret = unsafe {
            libc::sendto(
                self.fd,
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
                0,
                &sockaddr as *const _ as *const libc::sockaddr,
                mem::size_of_val(&sockaddr) as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        mio::unix::SourceFd(&self.fd).register(registry, token, mio::Interest::READABLE)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.fd).deregister(registry)
    }
}

impl Drop for LinuxPacketSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A non-blocking UDP socket bound to the DHCP client port.
pub struct LinuxUdpSocket {
    socket: UdpSocket,
}

impl LinuxUdpSocket {
    pub fn bind(client: Ipv4Addr, server: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(client, DHCP_PORT_CLIENT))?;
        socket.connect(SocketAddrV4::new(server, DHCP_PORT_SERVER))?;
        unsafe {
            let fd = socket.as_raw_fd();
            let enable: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &enable as *const _ as *const libc::c_void,
                mem::size_of_val(&enable) as libc::socklen_t,
            );
        }
        socket.set_nonblocking(true)?;
        socket.set_broadcast(true)?;
        debug!("opened udp socket bound to {}:{}, connected to {}:{}", client, DHCP_PORT_CLIENT, server, DHCP_PORT_SERVER);
        Ok(LinuxUdpSocket { socket })
    }
}

impl UdpTransport for LinuxUdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn send_unicast(&mut self, payload: &[u8], to: Ipv4Addr) -> io::Result<()> {
        self.socket
            .send_to(payload, SocketAddrV4::new(to, DHCP_PORT_SERVER))?;
        Ok(())
    }

    fn send_broadcast(&mut self, payload: &[u8]) -> io::Result<()> {
        self.socket
            .send_to(payload, SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_PORT_SERVER))?;
        Ok(())
    }

    fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        mio::unix::SourceFd(&self.socket.as_raw_fd()).register(registry, token, mio::Interest::READABLE)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        mio::unix::SourceFd(&self.socket.as_raw_fd()).deregister(registry)
    }
}

/// Builds real Linux sockets. The only production implementation of
/// [`SocketFactory`].
#[derive(Default)]
pub struct LinuxSocketFactory;

impl SocketFactory for LinuxSocketFactory {
    type Packet = LinuxPacketSocket;
    type Udp = LinuxUdpSocket;

    fn make_packet(&mut self, ifindex: i32) -> io::Result<Self::Packet> {
        LinuxPacketSocket::bind(ifindex)
    }

    fn make_udp(&mut self, client: Ipv4Addr, server: Ipv4Addr) -> io::Result<Self::Udp> {
        LinuxUdpSocket::bind(client, server)
    }
}

/// In-memory fakes used by `connection` tests. They never touch the
/// network: `recv` drains a queue the test pushed frames onto, and `send_*`
/// appends to a queue the test inspects afterward.
pub mod fake {
    use super::*;

    #[derive(Default)]
    pub struct FakePacketSocket {
        pub inbox: VecDeque<Vec<u8>>,
        pub broadcast_out: Vec<Vec<u8>>,
        pub broadcast_bhaddr: Vec<Vec<u8>>,
        pub deregistered: bool,
    }

    impl PacketSocket for FakePacketSocket {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbox.pop_front() {
                Some(frame) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    Ok(len)
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn send_broadcast(&mut self, payload: &[u8], bhaddr: &[u8]) -> io::Result<()> {
            self.broadcast_out.push(payload.to_vec());
            self.broadcast_bhaddr.push(bhaddr.to_vec());
            Ok(())
        }

        fn register(&mut self, _registry: &mio::Registry, _token: mio::Token) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &mio::Registry) -> io::Result<()> {
            self.deregistered = true;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeUdpSocket {
        pub inbox: VecDeque<Vec<u8>>,
        pub unicast_out: Vec<(Vec<u8>, Ipv4Addr)>,
        pub broadcast_out: Vec<Vec<u8>>,
        pub deregistered: bool,
    }

    impl UdpTransport for FakeUdpSocket {
        fn as_raw_fd(&self) -> RawFd {
            -1
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.inbox.pop_front() {
                Some(frame) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    Ok(len)
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn send_unicast(&mut self, payload: &[u8], to: Ipv4Addr) -> io::Result<()> {
            self.unicast_out.push((payload.to_vec(), to));
            Ok(())
        }

        fn send_broadcast(&mut self, payload: &[u8]) -> io::Result<()> {
            self.broadcast_out.push(payload.to_vec());
            Ok(())
        }

        fn register(&mut self, _registry: &mio::Registry, _token: mio::Token) -> io::Result<()> {
            Ok(())
        }

        fn deregister(&mut self, _registry: &mio::Registry) -> io::Result<()> {
            self.deregistered = true;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeSocketFactory;

    impl SocketFactory for FakeSocketFactory {
        type Packet = FakePacketSocket;
        type Udp = FakeUdpSocket;

        fn make_packet(&mut self, _ifindex: i32) -> io::Result<Self::Packet> {
            Ok(FakePacketSocket::default())
        }

        fn make_udp(&mut self, _client: Ipv4Addr, _server: Ipv4Addr) -> io::Result<Self::Udp> {
            Ok(FakeUdpSocket::default())
        }
    }
}
