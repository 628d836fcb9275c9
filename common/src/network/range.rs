use std::net::Ipv4Addr;

/// Inclusive range of IPv4 host addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Range {
    pub start_addr: Ipv4Addr,
    pub end_addr: Ipv4Addr,
}

impl Ipv4Range {
    pub fn new(start_addr: Ipv4Addr, end_addr: Ipv4Addr) -> Self {
        Self {
            start_addr,
            end_addr,
        }
    }

    /// Usable hosts of the subnet containing `addr`: the network and
    /// broadcast addresses are excluded. `None` for /31 and /32 masks.
    pub fn hosts_of(addr: Ipv4Addr, mask: Ipv4Addr) -> Option<Self> {
        let addr: u64 = u64::from(u32::from(addr));
        let mask: u64 = u64::from(u32::from(mask));
        let first: u64 = (addr & mask) + 1;
        let last: u64 = (addr | (!mask & 0xFFFF_FFFF)).checked_sub(1)?;
        if first > last {
            return None;
        }
        Some(Self::new(to_ipv4(first)?, to_ipv4(last)?))
    }

    pub fn len(&self) -> u64 {
        let start: u64 = u64::from(u32::from(self.start_addr));
        let end: u64 = u64::from(u32::from(self.end_addr));
        (end + 1).saturating_sub(start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let start: u32 = self.start_addr.into();
        let end: u32 = self.end_addr.into();
        (start..=end).map(Ipv4Addr::from)
    }
}

fn to_ipv4(value: u64) -> Option<Ipv4Addr> {
    u32::try_from(value).ok().map(Ipv4Addr::from)
}

/// Host addresses strictly between the network and broadcast address of
/// `addr`/`mask`, ascending, truncated to `cap` entries.
pub fn enumerate_hosts(addr: Ipv4Addr, mask: Ipv4Addr, cap: usize) -> Vec<Ipv4Addr> {
    match Ipv4Range::hosts_of(addr, mask) {
        Some(range) => range.to_iter().take(cap).collect(),
        None => Vec::new(),
    }
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
