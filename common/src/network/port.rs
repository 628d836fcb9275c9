//! Free UDP port selection.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::ops::Range;

use rand::Rng;
use rand::seq::IteratorRandom;
use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

/// Ports considered for random selection. The upper bound is exclusive.
pub const PORT_RANGE: Range<u16> = 1024..65534;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("UDP port {0} is already in use")]
    InUse(u16),

    #[error("no free UDP port in {start}..{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Every local UDP port some socket is bound to right now.
pub fn active_udp_ports() -> HashSet<u16> {
    match os_udp_ports() {
        Some(ports) => ports,
        None => {
            debug!("UDP listener table unavailable, probing {:?} by binding", PORT_RANGE);
            probe_bound_ports(PORT_RANGE)
        }
    }
}

pub fn is_free_udp_port(port: u16) -> bool {
    match os_udp_ports() {
        Some(ports) => !ports.contains(&port),
        None => is_bindable(port),
    }
}

/// Fails with [`PortError::InUse`] if `port` already has a listener.
pub fn ensure_free(port: u16) -> Result<u16, PortError> {
    if is_free_udp_port(port) {
        Ok(port)
    } else {
        Err(PortError::InUse(port))
    }
}

/// A port chosen uniformly at random among the currently free ones.
pub fn free_udp_port() -> Result<u16, PortError> {
    pick_free_port(PORT_RANGE, &active_udp_ports(), &mut rand::rng())
}

pub fn pick_free_port<R: Rng + ?Sized>(
    range: Range<u16>,
    in_use: &HashSet<u16>,
    rng: &mut R,
) -> Result<u16, PortError> {
    range
        .clone()
        .filter(|port| !in_use.contains(port))
        .choose(rng)
        .ok_or(PortError::Exhausted {
            start: range.start,
            end: range.end,
        })
}

fn probe_bound_ports(range: Range<u16>) -> HashSet<u16> {
    range.into_par_iter().filter(|port| !is_bindable(*port)).collect()
}

fn is_bindable(port: u16) -> bool {
    UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Local ports from the `local_address` column of a `/proc/net/udp{,6}` table.
fn parse_proc_udp(content: &str) -> Vec<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter_map(|local| local.rsplit_once(':'))
        .filter_map(|(_, port)| u16::from_str_radix(port, 16).ok())
        .collect()
}

#[cfg(target_os = "linux")]
fn os_udp_ports() -> Option<HashSet<u16>> {
    let mut ports: HashSet<u16> = HashSet::new();
    let mut any_table: bool = false;
    for table in ["/proc/net/udp", "/proc/net/udp6"] {
        match std::fs::read_to_string(table) {
            Ok(content) => {
                any_table = true;
                ports.extend(parse_proc_udp(&content));
            }
            Err(e) => debug!("cannot read {table}: {e}"),
        }
    }
    any_table.then_some(ports)
}

#[cfg(not(target_os = "linux"))]
fn os_udp_ports() -> Option<HashSet<u16>> {
    None
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
