//! Runs the DISCOVER/OFFER/REQUEST/ACK exchange against a real interface
//! and prints the lease it gets back.
//!
//! Needs `CAP_NET_RAW` (or root) to open the packet socket, and a free
//! port 68 on the chosen interface. Run as:
//!
//! ```text
//! sudo -E cargo run --example linux_client -- enp0s3 00:0c:29:13:0e:37
//! ```

use std::net::Ipv4Addr;
use std::time::Duration;

use dhcp4_proto::constants::{message_type, option_tag, HTYPE_ETHERNET, SIZE_HARDWARE_ADDRESS};
use dhcp_client::socket::LinuxSocketFactory;
use dhcp_client::{Connection, ConnectionConfig, CONNECTION_TOKEN};
use mio::{Events, Poll};

fn parse_mac(s: &str) -> [u8; SIZE_HARDWARE_ADDRESS] {
    let mut chaddr = [0u8; SIZE_HARDWARE_ADDRESS];
    for (i, byte) in s.split(':').enumerate().take(6) {
        chaddr[i] = u8::from_str_radix(byte, 16).expect("malformed MAC address");
    }
    chaddr
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let iface = args.next().unwrap_or_else(|| "eth0".to_owned());
    let mac = args.next().unwrap_or_else(|| "00:0c:29:13:0e:37".to_owned());
    let chaddr = parse_mac(&mac);

    let ifindex = dhcp_client::socket::ifindex(&iface)?;

    let poll = Poll::new()?;
    let config = ConnectionConfig {
        ifindex,
        htype: HTYPE_ETHERNET,
        hlen: 6,
        chaddr,
        bhaddr: [0xff; SIZE_HARDWARE_ADDRESS],
        client_id: Vec::new(),
        request_broadcast: false,
        mtu: 0,
    };

    let mut connection = Connection::new(&poll, LinuxSocketFactory, config)
        .expect("invalid connection configuration");
    connection.listen()?;

    let xid = 0x5a5a_5a5a;
    log::info!("sending DHCPDISCOVER on {} (ifindex {})", iface, ifindex);
    connection.discover(xid, 1)?;

    let mut events = Events::with_capacity(16);
    let mut buf = [0u8; 65536];
    loop {
        poll.poll(&mut events, Some(Duration::from_secs(10)))?;
        if events.iter().all(|event| event.token() != CONNECTION_TOKEN) {
            log::warn!("timed out waiting for a reply");
            continue;
        }

        while let Some(message) = connection.dispatch(&mut buf)? {
            let Some(msg_type) = message.options.get_u8(option_tag::DHCP_MESSAGE_TYPE) else {
                continue;
            };
            if msg_type == message_type::DHCPOFFER {
                let offered = message.header.yiaddr;
                let server = message
                    .options
                    .get_ipv4(option_tag::SERVER_IDENTIFIER)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                log::info!("offered {} by {}, sending DHCPREQUEST", offered, server);
                connection.select(xid, 2, offered, server)?;
            } else if msg_type == message_type::DHCPACK {
                log::info!(
                    "bound {} (lease time {:?})",
                    message.header.yiaddr,
                    message.options.get_u32(option_tag::ADDRESS_TIME)
                );
                return Ok(());
            } else if msg_type == message_type::DHCPNAK {
                log::warn!("server NAKed the request, giving up");
                return Ok(());
            }
        }
    }
}
