//! UDP listeners and their receive loops.
//!
//! Every listener owns one socket and one receive task. The task exits when
//! the engine's closing signal flips to `true`; it is never aborted.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol as IpProtocol, Socket, Type};
use sweepr_common::utils::hex::hexdump;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, trace, warn};

use crate::error::{EngineError, Result};

const RECV_ERROR_PAUSE: Duration = Duration::from_millis(50);

/// Receives every datagram with its sender.
pub(crate) type Inbound = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Global,
    PerInterface,
    Multicast,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerKind::Global => write!(f, "global"),
            ListenerKind::PerInterface => write!(f, "interface"),
            ListenerKind::Multicast => write!(f, "multicast"),
        }
    }
}

/// Everything a receive loop needs besides its socket.
#[derive(Clone)]
pub(crate) struct LoopContext {
    pub runtime: Handle,
    pub closing: watch::Receiver<bool>,
    pub inbound: Inbound,
    pub buffer_size: usize,
}

pub struct Listener {
    kind: ListenerKind,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Binds `addr` with broadcast enabled and starts its receive loop.
    pub(crate) fn spawn_unicast(
        kind: ListenerKind,
        addr: SocketAddrV4,
        ctx: LoopContext,
    ) -> Result<Self> {
        let std_socket: std::net::UdpSocket =
            bind_unicast(addr, ctx.buffer_size).map_err(|source| EngineError::Bind {
                addr: SocketAddr::V4(addr),
                source,
            })?;
        let socket: Arc<UdpSocket> = Arc::new(into_tokio(&ctx.runtime, std_socket)?);
        let local_addr: SocketAddr = socket.local_addr()?;
        info!("Listening on UDP {local_addr} ({kind})");

        let task: JoinHandle<()> = ctx.runtime.spawn(receive_loop(
            kind,
            socket.clone(),
            ctx.closing,
            ctx.inbound,
            ctx.buffer_size,
            None,
        ));

        Ok(Self {
            kind,
            local_addr,
            socket,
            task,
        })
    }

    /// Binds the wildcard address on the group's port and joins the group on
    /// every member interface. Interfaces that refuse the join are skipped.
    pub(crate) fn spawn_multicast(
        group: SocketAddrV4,
        members: &[(String, Ipv4Addr)],
        ctx: LoopContext,
    ) -> Result<Self> {
        let bind_addr: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        let std_socket: std::net::UdpSocket =
            bind_multicast(bind_addr, ctx.buffer_size).map_err(|source| EngineError::Bind {
                addr: SocketAddr::V4(bind_addr),
                source,
            })?;

        let joined: Vec<Ipv4Addr> = join_members(&std_socket, *group.ip(), members);
        let socket: Arc<UdpSocket> = Arc::new(into_tokio(&ctx.runtime, std_socket)?);
        let local_addr: SocketAddr = socket.local_addr()?;
        info!(
            "Listening on multicast {group} ({} interface(s) joined)",
            joined.len()
        );

        let task: JoinHandle<()> = ctx.runtime.spawn(receive_loop(
            ListenerKind::Multicast,
            socket.clone(),
            ctx.closing,
            ctx.inbound,
            ctx.buffer_size,
            Some((*group.ip(), joined)),
        ));

        Ok(Self {
            kind: ListenerKind::Multicast,
            local_addr,
            socket,
            task,
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Waits for the receive loop to exit. The closing signal must already be set.
    pub(crate) async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("{} listener on {} ended abnormally: {e}", self.kind, self.local_addr);
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

fn new_udp_socket(buffer_size: usize) -> io::Result<Socket> {
    let socket: Socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(IpProtocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
        debug!("cannot set receive buffer to {buffer_size} bytes: {e}");
    }
    Ok(socket)
}

fn bind_unicast(addr: SocketAddrV4, buffer_size: usize) -> io::Result<std::net::UdpSocket> {
    let socket: Socket = new_udp_socket(buffer_size)?;
    socket.set_broadcast(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn bind_multicast(addr: SocketAddrV4, buffer_size: usize) -> io::Result<std::net::UdpSocket> {
    let socket: Socket = new_udp_socket(buffer_size)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn join_members(
    socket: &std::net::UdpSocket,
    group: Ipv4Addr,
    members: &[(String, Ipv4Addr)],
) -> Vec<Ipv4Addr> {
    if members.is_empty() {
        warn!("No interface with an IPv4 address, joining {group} on the default interface");
        return match socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => vec![Ipv4Addr::UNSPECIFIED],
            Err(e) => {
                warn!("Failed to join {group} on the default interface: {e}");
                Vec::new()
            }
        };
    }

    members
        .iter()
        .filter_map(|(name, local)| match socket.join_multicast_v4(&group, local) {
            Ok(()) => {
                debug!("Joined {group} on {name} ({local})");
                Some(*local)
            }
            Err(e) => {
                warn!("Failed to join {group} on {name} ({local}): {e}");
                None
            }
        })
        .collect()
}

fn into_tokio(runtime: &Handle, socket: std::net::UdpSocket) -> Result<UdpSocket> {
    let _guard = runtime.enter();
    Ok(UdpSocket::from_std(socket)?)
}

async fn receive_loop(
    kind: ListenerKind,
    socket: Arc<UdpSocket>,
    mut closing: watch::Receiver<bool>,
    inbound: Inbound,
    buffer_size: usize,
    membership: Option<(Ipv4Addr, Vec<Ipv4Addr>)>,
) {
    let mut buf: Vec<u8> = vec![0u8; buffer_size];

    loop {
        tokio::select! {
            biased;
            _ = async { let _ = closing.wait_for(|closed| *closed).await; } => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    if tracing::enabled!(Level::TRACE) {
                        trace!("{kind} listener received {len} bytes from {from}\n{}", hexdump(&buf[..len]));
                    }
                    inbound(from, &buf[..len]);
                }
                Err(e) => {
                    warn!("{kind} listener receive error: {e}");
                    tokio::time::sleep(RECV_ERROR_PAUSE).await;
                }
            }
        }
    }

    if let Some((group, joined)) = membership {
        for local in joined {
            if let Err(e) = socket.leave_multicast_v4(group, local) {
                debug!("Failed to leave {group} on {local}: {e}");
            }
        }
    }
    debug!("{kind} listener receive loop stopped");
}

// ╔════════════════════════════════════════════╗
// ║ ████████╗███████╗███████╗████████╗███████╗ ║
// ║ ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝██╔════╝ ║
// ║    ██║   █████╗  ███████╗   ██║   ███████╗ ║
// ║    ██║   ██╔══╝  ╚════██║   ██║   ╚════██║ ║
// ║    ██║   ███████╗███████║   ██║   ███████║ ║
// ║    ╚═╝   ╚══════╝╚══════╝   ╚═╝   ╚══════╝ ║
// ╚════════════════════════════════════════════╝
