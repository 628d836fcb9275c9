use pnet::datalink::NetworkInterface;
use sweepr_common::network::interface::list_active_interfaces;

use crate::terminal::{network_fmt, print};

pub fn interfaces() -> anyhow::Result<()> {
    let interfaces: Vec<NetworkInterface> = list_active_interfaces();
    if interfaces.is_empty() {
        anyhow::bail!("No active network interface found");
    }

    for (idx, interface) in interfaces.iter().enumerate() {
        network_fmt::print_interface(interface, idx);
        if idx + 1 != interfaces.len() {
            print::blank();
        }
    }
    Ok(())
}
