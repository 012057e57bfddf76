//! Interface selection.
//!
//! Picks the local interface a server binds to or a client sends from,
//! either by explicit name or by scanning for a capability, and filters its
//! addresses by family.

use std::net::IpAddr;

use pnet_datalink::NetworkInterface;

use crate::error::{LanscoutError, Result};

/// Address family restriction for bind and destination addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddrFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddrFamily {
    /// Whether this family accepts `ip`.
    pub fn allows(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (AddrFamily::Any, _) => true,
            (AddrFamily::V4, IpAddr::V4(_)) => true,
            (AddrFamily::V6, IpAddr::V6(_)) => true,
            _ => false,
        }
    }

    /// The concrete family of `ip`.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddrFamily::V4,
            IpAddr::V6(_) => AddrFamily::V6,
        }
    }

    /// Protocol label used for socket operations in logs.
    pub fn proto(&self) -> &'static str {
        match self {
            AddrFamily::Any => "udp",
            AddrFamily::V4 => "udp4",
            AddrFamily::V6 => "udp6",
        }
    }
}

/// Link capability an interface can be selected by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Multicast,
    Broadcast,
    Loopback,
}

impl Capability {
    fn matches(&self, iface: &NetworkInterface) -> bool {
        match self {
            Capability::Multicast => iface.is_multicast(),
            Capability::Broadcast => iface.is_broadcast(),
            Capability::Loopback => iface.is_loopback(),
        }
    }
}

/// Returns the name of the first interface with the given capability and at
/// least one assigned address.
pub fn discover_interface(cap: Capability) -> Result<String> {
    pnet_datalink::interfaces()
        .into_iter()
        .find(|iface| cap.matches(iface) && !iface.ips.is_empty())
        .map(|iface| iface.name)
        .ok_or(LanscoutError::NoInterface)
}

/// Resolves the interface the transport will use.
///
/// A given name must exist; with no name, the first interface that can
/// multicast or broadcast and has at least one address wins.
pub fn resolve(name: Option<&str>) -> Result<NetworkInterface> {
    let interfaces = pnet_datalink::interfaces();
    match name {
        Some(name) => interfaces
            .into_iter()
            .find(|iface| iface.name == name)
            .ok_or(LanscoutError::InterfaceNotFound),
        None => interfaces
            .into_iter()
            .find(|iface| {
                (iface.is_multicast() || iface.is_broadcast()) && !iface.ips.is_empty()
            })
            .ok_or(LanscoutError::NoInterface),
    }
}

/// The interface addresses allowed by `family`, prefixes stripped.
pub fn candidate_addrs(iface: &NetworkInterface, family: AddrFamily) -> Vec<IpAddr> {
    iface
        .ips
        .iter()
        .map(|net| net.ip())
        .filter(|ip| family.allows(ip))
        .collect()
}

/// Whether the interface has any address of the given family.
pub fn has_family(iface: &NetworkInterface, family: AddrFamily) -> bool {
    iface.ips.iter().any(|net| family.allows(&net.ip()))
}
