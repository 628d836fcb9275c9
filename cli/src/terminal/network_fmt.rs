use std::net::{IpAddr, Ipv6Addr};

use colored::*;
use pnet::datalink::NetworkInterface;
use pnet::ipnetwork::IpNetwork;
use sweepr_common::network::interface::is_private_ipv4;

use crate::terminal::{colors, print};

pub fn ipv6_to_type_str(ipv6_addr: &Ipv6Addr) -> &'static str {
    let first_byte: u8 = ipv6_addr.octets()[0];
    if (0x20..=0x3F).contains(&first_byte) {
        return "GUA";
    }
    if ipv6_addr.is_unique_local() {
        return "ULA";
    }
    if ipv6_addr.is_unicast_link_local() {
        return "LLA";
    }
    "IPv6"
}

pub fn ip_to_key_value_pair(ip: IpAddr) -> (String, ColoredString) {
    match ip {
        IpAddr::V4(ipv4_addr) => ("IPv4".to_string(), ipv4_addr.to_string().color(colors::IPV4_ADDR)),
        IpAddr::V6(ipv6_addr) => (
            ipv6_to_type_str(&ipv6_addr).to_string(),
            ipv6_addr.to_string().color(colors::IPV6_ADDR),
        ),
    }
}

pub fn to_key_value_pair_net(ip_net: &[IpNetwork]) -> Vec<(String, ColoredString)> {
    ip_net
        .iter()
        .map(|ip_network| match ip_network {
            IpNetwork::V4(ipv4_network) => {
                let address: ColoredString = ipv4_network.ip().to_string().color(colors::IPV4_ADDR);
                let prefix: ColoredString =
                    ipv4_network.prefix().to_string().color(colors::IPV4_PREFIX);
                let sweep: ColoredString = if is_private_ipv4(ipv4_network.ip()) && ipv4_network.prefix() < 31 {
                    "sweepable".green()
                } else {
                    "no sweep".bright_black()
                };
                let result: ColoredString = format!(
                    "{address}/{prefix} mask {} ({sweep})",
                    ipv4_network.mask()
                )
                .color(colors::SEPARATOR);
                ("IPv4".to_string(), result)
            }
            IpNetwork::V6(ipv6_network) => {
                let address: ColoredString = ipv6_network.ip().to_string().color(colors::IPV6_ADDR);
                let prefix: ColoredString =
                    ipv6_network.prefix().to_string().color(colors::IPV6_PREFIX);
                let value: ColoredString = format!("{address}/{prefix}").color(colors::SEPARATOR);
                (ipv6_to_type_str(&ipv6_network.ip()).to_string(), value)
            }
        })
        .collect()
}

pub fn print_interface(interface: &NetworkInterface, idx: usize) {
    let mut key_value_pair: Vec<(String, ColoredString)> = to_key_value_pair_net(&interface.ips);
    if let Some(mac_addr) = interface.mac {
        key_value_pair.push((
            "MAC".to_string(),
            mac_addr.to_string().color(colors::MAC_ADDR),
        ));
    }
    print::tree(idx, &interface.name, &key_value_pair);
}
