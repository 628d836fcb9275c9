//! Live queries over the OS interface table.
//!
//! Nothing here is cached: interfaces come and go between scans, so every
//! call asks the OS again.

use std::net::{IpAddr, Ipv4Addr};

use pnet::datalink::{self, NetworkInterface};

use crate::utils::interface::NetworkInterfaceExtension;

const HOST_MASK: Ipv4Addr = Ipv4Addr::BROADCAST;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Interfaces whose operational status is up.
pub fn list_active_interfaces() -> Vec<NetworkInterface> {
    active_only(datalink::interfaces())
}

fn active_only(interfaces: Vec<NetworkInterface>) -> Vec<NetworkInterface> {
    interfaces.into_iter().filter(|i| i.is_up()).collect()
}

/// Unicast addresses of `family` bound to `interface`.
pub fn list_addresses(interface: &NetworkInterface, family: AddressFamily) -> Vec<IpAddr> {
    interface
        .ips
        .iter()
        .map(|net| net.ip())
        .filter(|ip| match (family, ip) {
            (AddressFamily::V4, IpAddr::V4(_)) | (AddressFamily::V6, IpAddr::V6(_)) => true,
            _ => false,
        })
        .filter(|ip| !ip.is_multicast() && !ip.is_unspecified())
        .collect()
}

/// Every IPv4 address bound to an up interface, in interface order.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    ipv4_addresses_of(&list_active_interfaces())
}

fn ipv4_addresses_of(interfaces: &[NetworkInterface]) -> Vec<Ipv4Addr> {
    interfaces
        .iter()
        .flat_map(|iface| list_addresses(iface, AddressFamily::V4))
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .collect()
}

/// The address each up interface should use for multicast group membership:
/// its first IPv4 address. Interfaces without one are left out.
pub fn multicast_members() -> Vec<(String, Ipv4Addr)> {
    list_active_interfaces()
        .iter()
        .filter_map(|iface| iface.first_ipv4().map(|ip| (iface.name.clone(), ip)))
        .collect()
}

/// The mask bound alongside `address`, or `255.255.255.255` when no up
/// interface carries it. A host mask disables sweeping for that address.
pub fn subnet_mask_of(address: Ipv4Addr) -> Ipv4Addr {
    mask_in(&list_active_interfaces(), address)
}

pub fn mask_in(interfaces: &[NetworkInterface], address: Ipv4Addr) -> Ipv4Addr {
    interfaces
        .iter()
        .filter(|iface| iface.is_up())
        .flat_map(|iface| iface.get_ipv4_nets())
        .find(|net| net.ip() == address)
        .map(|net| net.mask())
        .unwrap_or(HOST_MASK)
}

/// RFC1918 ranges plus IPv4 link-local. Sweeps are only run on these.
pub fn is_private_ipv4(address: Ipv4Addr) -> bool {
    address.is_private() || address.is_link_local()
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
