use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};

use anyhow::{Context, bail};
use bstr::BStr;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::{debug, trace};

pub const SSDP_PORT: u16 = 1900;
pub const SSDP_MCAST_IPV4: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_MCAST_IPV6_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xc);
pub const SSDP_MCAST_IPV6_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0xc);

/// Receiver of SSDP datagrams. The discovery engine behind it is not part
/// of the miniserver; the listener only reads the datagram and hands it
/// over together with the socket to answer on.
pub trait SsdpHandler: Send + Sync {
    fn on_datagram(
        &self,
        data: &[u8],
        from: SocketAddr,
        sock: &UdpSocket,
    ) -> anyhow::Result<()>;
}

#[derive(Debug)]
pub enum SsdpMessage<'a, 'h> {
    MSearch(SsdpMSearchRequest<'a>),
    OtherRequest(httparse::Request<'h, 'a>),
    Response(httparse::Response<'h, 'a>),
}

#[derive(Debug)]
pub struct SsdpMSearchRequest<'a> {
    pub host: &'a BStr,
    pub man: &'a BStr,
    pub st: &'a BStr,
    pub mx: Option<&'a BStr>,
}

impl SsdpMSearchRequest<'_> {
    pub fn is_discover(&self) -> bool {
        self.man == "\"ssdp:discover\""
    }
}

/// Parse one SSDP datagram using a caller-provided header array.
pub fn try_parse_ssdp<'a, 'h>(
    buf: &'a [u8],
    headers: &'h mut [httparse::Header<'a>],
) -> anyhow::Result<SsdpMessage<'a, 'h>> {
    if buf.starts_with(b"HTTP/") {
        let mut resp = httparse::Response::new(headers);
        resp.parse(buf).context("error parsing response")?;
        return Ok(SsdpMessage::Response(resp));
    }

    let mut req = httparse::Request::new(headers);
    req.parse(buf).context("error parsing request")?;

    match req.method {
        Some("M-SEARCH") => {
            let mut host = None;
            let mut man = None;
            let mut st = None;
            let mut mx = None;

            for header in req.headers.iter() {
                match header.name {
                    "HOST" | "Host" | "host" => host = Some(header.value),
                    "MAN" | "Man" | "man" => man = Some(header.value),
                    "ST" | "St" | "st" => st = Some(header.value),
                    "MX" | "Mx" | "mx" => mx = Some(header.value),
                    other => trace!(header=?BStr::new(other.as_bytes()), "ignoring SSDP header"),
                }
            }

            match (host, man, st) {
                (Some(host), Some(man), Some(st)) => Ok(SsdpMessage::MSearch(SsdpMSearchRequest {
                    host: BStr::new(host),
                    man: BStr::new(man),
                    st: BStr::new(st),
                    mx: mx.map(BStr::new),
                })),
                _ => bail!("not all of host, man and st are set"),
            }
        }
        _ => Ok(SsdpMessage::OtherRequest(req)),
    }
}

fn socket_presetup(bind_addr: SocketAddr) -> anyhow::Result<socket2::Socket> {
    let domain = if bind_addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let sock = socket2::Socket::new(domain, socket2::Type::DGRAM, None)
        .context("error creating socket")?;
    #[cfg(not(target_os = "windows"))]
    sock.set_reuse_port(true)
        .context("error setting SO_REUSEPORT")?;
    sock.set_reuse_address(true)
        .context("error setting SO_REUSEADDR")?;
    if bind_addr.is_ipv6() {
        sock.set_only_v6(true).context("error setting IPV6_V6ONLY")?;
    }

    trace!(addr=?bind_addr, "binding UDP");
    sock.bind(&bind_addr.into()).context("error binding")?;

    Ok(sock)
}

fn ipv6_is_link_local(ip: Ipv6Addr) -> bool {
    const LL: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0);
    const MASK: Ipv6Addr = Ipv6Addr::new(0xffff, 0xffff, 0xffff, 0xffff, 0, 0, 0, 0);

    ip.to_bits() & MASK.to_bits() == LL.to_bits() & MASK.to_bits()
}

/// Bind the IPv4 SSDP receive socket and join the multicast group on every
/// eligible interface.
pub fn bind_v4_socket() -> anyhow::Result<UdpSocket> {
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    let socket = socket_presetup(bind_addr.into())?;

    let default_membership = std::iter::once(Ipv4Addr::UNSPECIFIED);
    let all_membership_ips = NetworkInterface::show()
        .into_iter()
        .flatten()
        .flat_map(|nic| nic.addr.into_iter())
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(a) if a.is_private() && !a.is_loopback() => Some(a),
            _ => None,
        });

    for ifaddr in default_membership.chain(all_membership_ips) {
        trace!(multiaddr=?SSDP_MCAST_IPV4, interface=?ifaddr, "joining multicast v4 group");
        if let Err(e) = socket.join_multicast_v4(&SSDP_MCAST_IPV4, &ifaddr) {
            debug!(multiaddr=?SSDP_MCAST_IPV4, interface=?ifaddr, "error joining multicast v4 group: {e:#}");
        }
    }

    Ok(socket.into())
}

/// Bind one of the IPv6 SSDP receive sockets. The link-local socket joins
/// `FF02::C`, the ULA/GUA one `FF05::C`.
pub fn bind_v6_socket(link_local: bool) -> anyhow::Result<UdpSocket> {
    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, SSDP_PORT, 0, 0);
    let socket = socket_presetup(bind_addr.into())?;
    let multiaddr = if link_local {
        SSDP_MCAST_IPV6_LINK_LOCAL
    } else {
        SSDP_MCAST_IPV6_SITE_LOCAL
    };

    for nic in NetworkInterface::show().into_iter().flatten() {
        let wanted = nic.addr.iter().any(|addr| match addr.ip() {
            IpAddr::V6(v6) if !v6.is_loopback() => ipv6_is_link_local(v6) == link_local,
            _ => false,
        });
        if !wanted {
            continue;
        }
        trace!(multiaddr=?multiaddr, interface=?nic.index, "joining multicast v6 group");
        if let Err(e) = socket.join_multicast_v6(&multiaddr, nic.index) {
            debug!(multiaddr=?multiaddr, interface=?nic.index, "error joining multicast v6 group: {e:#}");
        }
    }

    Ok(socket.into())
}

/// Ephemeral socket for client-mode search requests and replies.
pub fn bind_request_socket(ipv6: bool) -> anyhow::Result<UdpSocket> {
    let bind_addr: SocketAddr = if ipv6 {
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into()
    } else {
        SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = socket_presetup(bind_addr)?;
    Ok(socket.into())
}

/// Read one datagram and hand it to the SSDP engine. An error tells the
/// listener to close this socket and drop it from the poll set.
pub fn read_datagram(sock: &UdpSocket, handler: &dyn SsdpHandler) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    let (sz, addr) = sock.recv_from(&mut buf).context("error receiving")?;
    let data = &buf[..sz];
    trace!(content = ?BStr::new(data), ?addr, "received SSDP datagram");
    handler
        .on_datagram(data, addr, sock)
        .context("error processing incoming SSDP message")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_msearch() {
        let raw = b"M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nMAN: \"ssdp:discover\"\r\nMX: 2\r\nST: upnp:rootdevice\r\n\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        match try_parse_ssdp(raw, &mut headers).unwrap() {
            SsdpMessage::MSearch(m) => {
                assert!(m.is_discover());
                assert_eq!(m.st, "upnp:rootdevice");
                assert_eq!(m.mx.unwrap(), "2");
            }
            other => panic!("expected M-SEARCH, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notify_is_other_request() {
        let raw = b"NOTIFY * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\nNT: upnp:rootdevice\r\nNTS: ssdp:alive\r\n\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        assert!(matches!(
            try_parse_ssdp(raw, &mut headers).unwrap(),
            SsdpMessage::OtherRequest(_)
        ));
    }

    #[test]
    fn test_parse_response() {
        let raw = b"HTTP/1.1 200 OK\r\nST: upnp:rootdevice\r\nLOCATION: http://192.0.2.1:49152/desc.xml\r\n\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        assert!(matches!(
            try_parse_ssdp(raw, &mut headers).unwrap(),
            SsdpMessage::Response(_)
        ));
    }

    #[test]
    fn test_msearch_missing_headers_is_error() {
        let raw = b"M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1900\r\n\r\n";
        let mut headers = [httparse::EMPTY_HEADER; 16];
        assert!(try_parse_ssdp(raw, &mut headers).is_err());
    }
}
