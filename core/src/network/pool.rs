use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{SockAddr, SockRef};
use tokio::net::UdpSocket;

use super::listener::{Listener, ListenerKind};

/// The sending half of a listener socket.
pub(crate) trait Datagram: Send + Sync + fmt::Debug {
    /// Hands `data` to the OS for `dest` without waiting for readiness.
    fn send_datagram(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize>;
}

impl Datagram for UdpSocket {
    // tokio's try_send_to reports WouldBlock until the reactor has seen the
    // socket writable once, so the send goes straight to the OS socket
    fn send_datagram(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
        SockRef::from(self).send_to(data, &SockAddr::from(dest))
    }
}

/// A socket that outbound datagrams can be sent from, detached from its listener.
#[derive(Debug, Clone)]
pub(crate) struct Outlet {
    pub kind: ListenerKind,
    pub local_addr: SocketAddr,
    pub socket: Arc<dyn Datagram>,
}

impl Outlet {
    fn of(listener: &Listener) -> Self {
        Self {
            kind: listener.kind(),
            local_addr: listener.local_addr(),
            socket: listener.socket() as Arc<dyn Datagram>,
        }
    }

    pub fn source_ipv4(&self) -> Option<Ipv4Addr> {
        match self.local_addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        }
    }
}

/// The engine's listener set: one optional global listener, any number of
/// per-interface listeners and one optional multicast listener.
#[derive(Debug, Default)]
pub(crate) struct ListenerPool {
    pub global: Option<Listener>,
    pub interfaces: Vec<Listener>,
    pub multicast: Option<Listener>,
}

impl ListenerPool {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.interfaces.is_empty() && self.multicast.is_none()
    }

    pub fn has_interface(&self, addr: IpAddr) -> bool {
        self.interfaces.iter().any(|l| l.local_addr().ip() == addr)
    }

    /// Snapshot of the active unicast sockets, global first.
    ///
    /// The multicast socket is excluded: it only receives.
    pub fn senders(&self) -> Vec<Outlet> {
        self.global
            .iter()
            .chain(self.interfaces.iter())
            .filter(|l| l.is_active())
            .map(Outlet::of)
            .collect()
    }

    pub fn global_sender(&self) -> Option<Outlet> {
        self.global.as_ref().filter(|l| l.is_active()).map(Outlet::of)
    }

    pub fn interface_senders(&self) -> Vec<Outlet> {
        self.interfaces
            .iter()
            .filter(|l| l.is_active())
            .map(Outlet::of)
            .collect()
    }

    pub fn listeners(&self) -> impl Iterator<Item = &Listener> {
        self.global
            .iter()
            .chain(self.interfaces.iter())
            .chain(self.multicast.iter())
    }

    /// Empties the pool, handing back every listener for joining.
    pub fn drain(&mut self) -> Vec<Listener> {
        let mut all: Vec<Listener> = Vec::with_capacity(self.interfaces.len() + 2);
        all.extend(self.global.take());
        all.append(&mut self.interfaces);
        all.extend(self.multicast.take());
        all
    }
}
