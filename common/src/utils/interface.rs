use std::net::Ipv4Addr;

use pnet::datalink::NetworkInterface;
use pnet::ipnetwork::{IpNetwork, Ipv4Network};

pub trait NetworkInterfaceExtension {
    fn get_ipv4_nets(&self) -> Vec<Ipv4Network>;
    /// The address used to join multicast groups on this interface.
    fn first_ipv4(&self) -> Option<Ipv4Addr>;
}

impl NetworkInterfaceExtension for NetworkInterface {
    fn get_ipv4_nets(&self) -> Vec<Ipv4Network> {
        self.ips
            .iter()
            .filter_map(|ip| {
                if let IpNetwork::V4(ipv4) = ip {
                    Some(*ipv4)
                } else {
                    None
                }
            })
            .collect()
    }

    fn first_ipv4(&self) -> Option<Ipv4Addr> {
        self.get_ipv4_nets().first().map(|net| net.ip())
    }
}
