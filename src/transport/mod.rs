//! Transport binding.
//!
//! Decides how the UDP endpoint is opened on the selected interface: the
//! server joins a multicast group when it can (and is allowed to), otherwise
//! binds a plain socket; the client computes one destination per candidate
//! address, preferring loopback, then multicast, then broadcast.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use pnet_datalink::NetworkInterface;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{LanscoutError, Result};
use crate::iface::{self, AddrFamily};

/// Multicast group addresses the server joins and the client targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Groups {
    pub v4: Ipv4Addr,
    pub v6: Ipv6Addr,
}

impl Default for Groups {
    fn default() -> Self {
        Self {
            v4: Ipv4Addr::new(224, 0, 0, 1),
            v6: Ipv6Addr::new(0xff00, 0, 0, 0, 0, 0, 0, 1),
        }
    }
}

/// IPv6 link-local all-nodes group, the v6 stand-in for a broadcast.
const ALL_NODES_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Opens the server's UDP endpoint on `iface`.
///
/// Joins the multicast group when multicast is available and not disabled,
/// otherwise binds a plain socket on `port` (0 lets the OS choose). Returns
/// the socket, the actual port, and the concrete family of the local
/// address.
pub async fn bind_server(
    iface: &NetworkInterface,
    family: AddrFamily,
    port: u16,
    groups: &Groups,
    disable_multicast: bool,
) -> Result<(UdpSocket, u16, AddrFamily)> {
    let socket = if !disable_multicast && iface.is_multicast() {
        join_group(iface, family, port, groups).await?
    } else {
        plain_bind(iface, family, port).await?
    };

    let local = socket.local_addr()?;
    tracing::debug!(
        "server bound on {} ({})",
        local,
        AddrFamily::of(&local.ip()).proto()
    );
    Ok((socket, local.port(), AddrFamily::of(&local.ip())))
}

/// Computes the destination for one candidate client address, by interface
/// capability: loopback targets the address itself, multicast targets the
/// group of the address family, broadcast targets the all-nodes address.
pub fn client_destination(
    iface: &NetworkInterface,
    addr: &IpAddr,
    port: u16,
    groups: &Groups,
    disable_multicast: bool,
) -> Result<SocketAddr> {
    if iface.is_loopback() {
        return sock_addr(addr, port, iface);
    }
    if !disable_multicast && iface.is_multicast() {
        return Ok(match addr {
            IpAddr::V4(_) => SocketAddr::V4(SocketAddrV4::new(groups.v4, port)),
            IpAddr::V6(_) => {
                SocketAddr::V6(SocketAddrV6::new(groups.v6, port, 0, iface.index))
            }
        });
    }
    if iface.is_broadcast() {
        return Ok(match addr {
            IpAddr::V4(_) => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, port)),
            IpAddr::V6(_) => {
                SocketAddr::V6(SocketAddrV6::new(ALL_NODES_V6, port, 0, iface.index))
            }
        });
    }
    Err(LanscoutError::CantFindInterface)
}

/// Builds a socket address from an interface address, attaching the
/// interface scope id to link-local IPv6 addresses (the `[addr%zone]:port`
/// form).
pub fn sock_addr(ip: &IpAddr, port: u16, iface: &NetworkInterface) -> Result<SocketAddr> {
    match ip {
        IpAddr::V4(v4) => Ok(SocketAddr::V4(SocketAddrV4::new(*v4, port))),
        IpAddr::V6(v6) => {
            let scope = if is_link_local(v6) { iface.index } else { 0 };
            Ok(SocketAddr::V6(SocketAddrV6::new(*v6, port, 0, scope)))
        }
    }
}

/// fe80::/10
fn is_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

fn udp_socket(domain: Domain) -> Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Binds on the unspecified address and joins the group: the v6 group when
/// the interface has an IPv6 address and the family permits it, the v4
/// group otherwise.
async fn join_group(
    iface: &NetworkInterface,
    family: AddrFamily,
    port: u16,
    groups: &Groups,
) -> Result<UdpSocket> {
    let has_v4 = iface::has_family(iface, AddrFamily::V4);
    let has_v6 = iface::has_family(iface, AddrFamily::V6);
    if !has_v4 && !has_v6 {
        return Err(LanscoutError::InvalidIp);
    }

    if has_v6 && family != AddrFamily::V4 {
        let socket = udp_socket(Domain::IPV6)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let bind = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        socket.bind(&bind.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v6(&groups.v6, iface.index)?;
        Ok(socket)
    } else {
        let socket = udp_socket(Domain::IPV4)?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&bind.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        socket.join_multicast_v4(groups.v4, local_v4(iface))?;
        Ok(socket)
    }
}

/// Plain bind on the unspecified address of the requested family. `Any`
/// binds a dual-stack v6 socket when the host allows it, falling back to v4.
async fn plain_bind(
    iface: &NetworkInterface,
    family: AddrFamily,
    port: u16,
) -> Result<UdpSocket> {
    match family {
        AddrFamily::V4 => {
            Ok(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?)
        }
        AddrFamily::V6 => {
            Ok(UdpSocket::bind(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)).await?)
        }
        AddrFamily::Any => match dual_stack_bind(port) {
            Ok(socket) => Ok(socket),
            Err(e) => {
                tracing::debug!("dual-stack bind failed on {}: {}", iface.name, e);
                Ok(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).await?)
            }
        },
    }
}

fn dual_stack_bind(port: u16) -> Result<UdpSocket> {
    let socket = udp_socket(Domain::IPV6)?;
    socket.set_only_v6(false)?;
    let bind = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
    socket.bind(&bind.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// First IPv4 address of the interface, for the v4 group join.
fn local_v4(iface: &NetworkInterface) -> Ipv4Addr {
    iface
        .ips
        .iter()
        .find_map(|net| match net.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}
