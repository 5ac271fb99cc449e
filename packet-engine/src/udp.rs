//! UDP transport.
//!
//! [`UdpTransport`] is a thin wrapper around `tokio::net::UdpSocket` that
//! implements [`PacketTransport`]. Peers are encoded into a [`PacketDest`]
//! as a packed IPv4 socket address:
//!
//! ```text
//!  byte 0..2    address family (2, little-endian)
//!  byte 2..4    port (network byte order)
//!  byte 4..8    IPv4 address octets
//!  byte 8..16   zero
//! ```

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, info};
use tokio::net::UdpSocket;

use crate::error::TransportError;
use crate::transport::{PacketDest, PacketTransport, PACKET_DEST_LEN};

/// MTU assumed when the interface cannot report one.
const DEFAULT_LINK_MTU: usize = 1500;
const IPV4_HEADER: usize = 20;
const UDP_HEADER: usize = 8;
const AF_INET_WIRE: u16 = 2;

/// Largest UDP payload for a link MTU, rounded down to four bytes.
pub fn payload_mtu(link_mtu: usize) -> usize {
    link_mtu.saturating_sub(IPV4_HEADER + UDP_HEADER) & !3
}

/// Encode an IPv4 endpoint as a peer token.
pub fn packet_dest(ip: Ipv4Addr, port: u16) -> PacketDest {
    let mut data = [0u8; PACKET_DEST_LEN];
    data[0..2].copy_from_slice(&AF_INET_WIRE.to_le_bytes());
    data[2..4].copy_from_slice(&port.to_be_bytes());
    data[4..8].copy_from_slice(&ip.octets());
    PacketDest::new(data)
}

/// Decode a peer token made by [`packet_dest`].
pub fn socket_addr(dest: &PacketDest) -> Option<SocketAddrV4> {
    let b = dest.as_bytes();
    if u16::from_le_bytes([b[0], b[1]]) != AF_INET_WIRE {
        return None;
    }
    let port = u16::from_be_bytes([b[2], b[3]]);
    let ip = Ipv4Addr::new(b[4], b[5], b[6], b[7]);
    Some(SocketAddrV4::new(ip, port))
}

// ---------------------------------------------------------------------------
// Interface lookup
// ---------------------------------------------------------------------------

/// First IPv4 address bound to the interface called `name`.
#[cfg(unix)]
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().map_err(io::Error::other)?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(*SocketAddrV4::from(*sin).ip());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("interface {name} has no IPv4 address"),
    ))
}

#[cfg(not(unix))]
pub fn interface_ipv4(name: &str) -> io::Result<Ipv4Addr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("interface lookup for {name} is not supported on this platform"),
    ))
}

/// Link MTU of the interface called `name`.
#[cfg(target_os = "linux")]
pub fn interface_mtu(name: &str) -> io::Result<usize> {
    let raw = std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad mtu for {name}: {e}")))
}

#[cfg(not(target_os = "linux"))]
pub fn interface_mtu(_name: &str) -> io::Result<usize> {
    Ok(DEFAULT_LINK_MTU)
}

// ---------------------------------------------------------------------------
// UdpTransport
// ---------------------------------------------------------------------------

/// A [`PacketTransport`] over one UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    local: SocketAddrV4,
    mtu: usize,
}

impl UdpTransport {
    /// Bind to `port` on the IPv4 address of interface `iface`. The MTU is
    /// taken from the interface. Port 0 picks a free port.
    pub async fn bind(iface: &str, port: u16) -> Result<Self, TransportError> {
        let ip = interface_ipv4(iface)?;
        let link_mtu = interface_mtu(iface).unwrap_or_else(|e| {
            debug!("[udp] mtu of {iface} unknown ({e}); assuming {DEFAULT_LINK_MTU}");
            DEFAULT_LINK_MTU
        });
        Self::bind_addr(SocketAddrV4::new(ip, port), payload_mtu(link_mtu)).await
    }

    /// Bind to an explicit address with an explicit payload MTU.
    pub async fn bind_addr(addr: SocketAddrV4, mtu: usize) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "IPv6 socket where IPv4 was requested",
                )))
            }
        };
        info!("[udp] bound {local} (mtu {mtu})");
        Ok(Self { socket, local, mtu })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn ip_addr(&self) -> Ipv4Addr {
        *self.local.ip()
    }

    pub fn port(&self) -> u16 {
        self.local.port()
    }

    /// Token for our own endpoint, as peers see it.
    pub fn local_dest(&self) -> PacketDest {
        packet_dest(*self.local.ip(), self.local.port())
    }
}

impl PacketTransport for UdpTransport {
    fn source_mtu(&self) -> usize {
        self.mtu
    }

    fn sink_mtu(&self) -> usize {
        self.mtu
    }

    async fn push_packet_bytes(&self, buf: &[u8], dest: &PacketDest) -> Result<(), TransportError> {
        if buf.len() > self.mtu {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("datagram of {} bytes exceeds mtu {}", buf.len(), self.mtu),
            )));
        }
        let addr = socket_addr(dest).ok_or(TransportError::Unreachable)?;
        match self.socket.try_send_to(buf, SocketAddr::V4(addr)) {
            Ok(n) if n == buf.len() => Ok(()),
            Ok(n) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {n} of {} bytes", buf.len()),
            ))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(TransportError::Busy),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    async fn pull_packet_bytes(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, PacketDest), TransportError> {
        loop {
            let (n, from) = match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
                Err(_) => return Err(TransportError::TimedOut),
                Ok(r) => r?,
            };
            match from {
                SocketAddr::V4(a) => return Ok((n, packet_dest(*a.ip(), a.port()))),
                SocketAddr::V6(a) => debug!("[udp] ignoring datagram from {a}"),
            }
        }
    }

    async fn source_ready(&self) {
        let _ = self.socket.readable().await;
    }

    async fn sink_ready(&self) {
        let _ = self.socket.writable().await;
    }

    fn describe(&self, dest: &PacketDest) -> String {
        match socket_addr(dest) {
            Some(a) => format!("{} ({})", a.ip(), a.port()),
            None => format!("{dest:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dest_layout_is_packed_sockaddr_in() {
        let d = packet_dest(Ipv4Addr::new(192, 168, 1, 20), 9955);
        let b = d.as_bytes();
        assert_eq!(&b[0..2], &[2, 0]);
        assert_eq!(&b[2..4], &9955u16.to_be_bytes());
        assert_eq!(&b[4..8], &[192, 168, 1, 20]);
        assert!(b[8..].iter().all(|&x| x == 0));
        assert_eq!(socket_addr(&d), Some(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 9955)));
    }

    #[test]
    fn foreign_tokens_do_not_decode() {
        assert_eq!(socket_addr(&PacketDest::new([0; PACKET_DEST_LEN])), None);
    }

    #[test]
    fn payload_mtu_strips_headers_and_aligns() {
        assert_eq!(payload_mtu(1500), 1472);
        assert_eq!(payload_mtu(1401), 1372);
        assert_eq!(payload_mtu(10), 0);
    }

    #[tokio::test]
    async fn loopback_datagram() {
        let a = UdpTransport::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 512)
            .await
            .unwrap();
        let b = UdpTransport::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 512)
            .await
            .unwrap();

        let mut sent = false;
        for _ in 0..10 {
            match a.push_packet_bytes(b"hello", &b.local_dest()).await {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(TransportError::Busy) => a.sink_ready().await,
                Err(e) => panic!("send failed: {e}"),
            }
        }
        assert!(sent);

        let mut buf = [0u8; 512];
        let (n, from) = b.pull_packet_bytes(&mut buf, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_dest());
        assert_eq!(b.describe(&from), format!("127.0.0.1 ({})", a.port()));
    }

    #[tokio::test]
    async fn oversized_datagram_rejected() {
        let a = UdpTransport::bind_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 32)
            .await
            .unwrap();
        let err = a.push_packet_bytes(&[0u8; 33], &a.local_dest()).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
