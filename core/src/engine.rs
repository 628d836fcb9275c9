//! # Scan engine
//!
//! Hosts one [`Protocol`] and owns every socket it talks through.
//!
//! The engine is created inside a tokio runtime and remembers that runtime,
//! so its synchronous methods (`start_*`, `send*`, `scan`) can also be called
//! from plain threads. Shutdown is explicit: [`Engine::stop_all`] flips the
//! closing signal, waits for the sweep and every receive loop to exit and
//! only then releases the sockets. Dropping the engine flips the signal too,
//! so no receive loop outlives it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use sweepr_common::config::{Config, ListenMode};
use sweepr_common::network::interface::{
    local_ipv4_addresses, multicast_members, subnet_mask_of,
};
use sweepr_common::network::port::{ensure_free, free_udp_port};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discovery::{Protocol, ScannerViewer, Transmit};
use crate::error::{EngineError, Result};
use crate::network::listener::{Inbound, Listener, ListenerKind, LoopContext};
use crate::network::pool::{ListenerPool, Outlet};
use crate::scanner::{self, ScanHandle, SweepJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No listener started yet.
    Idle,
    Listening,
    /// Shut down; every operation now fails with [`EngineError::Closed`].
    Closed,
}

pub struct Engine<P: Protocol> {
    protocol: Arc<P>,
    config: Config,
    runtime: Handle,
    pool: Mutex<ListenerPool>,
    closing: watch::Sender<bool>,
    scan: tokio::sync::Mutex<Option<ScanHandle>>,
    viewer: RwLock<Option<Arc<dyn ScannerViewer>>>,
}

impl<P: Protocol> Engine<P> {
    pub fn new(protocol: P) -> Result<Self> {
        Self::with_config(protocol, Config::default())
    }

    pub fn with_config(protocol: P, config: Config) -> Result<Self> {
        let runtime: Handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let (closing, _) = watch::channel(false);
        Ok(Self {
            protocol: Arc::new(protocol),
            config,
            runtime,
            pool: Mutex::new(ListenerPool::default()),
            closing,
            scan: tokio::sync::Mutex::new(None),
            viewer: RwLock::new(None),
        })
    }

    pub fn protocol(&self) -> &Arc<P> {
        &self.protocol
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        if self.is_closed() {
            EngineState::Closed
        } else if self.pool().is_empty() {
            EngineState::Idle
        } else {
            EngineState::Listening
        }
    }

    /// Stores `viewer` and tells it how to label this engine's protocol.
    pub fn register_viewer(&self, viewer: Arc<dyn ScannerViewer>) {
        viewer.format_protocol(self.protocol.name(), self.protocol.color());
        *self.viewer.write().unwrap_or_else(PoisonError::into_inner) = Some(viewer);
    }

    pub fn viewer(&self) -> Option<Arc<dyn ScannerViewer>> {
        self.viewer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts the configured unicast listeners and, when enabled, the
    /// protocol's multicast listener.
    ///
    /// A multicast bind failure is logged and leaves the unicast side running.
    pub fn start(&self) -> Result<()> {
        match self.config.listen_mode {
            ListenMode::Global => {
                self.start_global(self.config.global_port)?;
            }
            ListenMode::PerInterface => {
                if self.start_per_interface()? == 0 {
                    warn!("No interface listener could be started");
                }
            }
        }

        if self.config.multicast {
            if let Some(group) = self.protocol.multicast_group() {
                if let Err(e) = self.start_multicast(group) {
                    warn!("Multicast listener on {group} not started: {e}");
                }
            }
        }
        Ok(())
    }

    /// Binds the wildcard listener and returns its port.
    ///
    /// `port == 0` picks a random free port.
    pub fn start_global(&self, port: u16) -> Result<u16> {
        self.ensure_open()?;
        let mut pool = self.pool();
        if pool.global.is_some() {
            return Err(EngineError::AlreadyListening(ListenerKind::Global));
        }

        let port: u16 = if port != 0 {
            ensure_free(port)?
        } else {
            free_udp_port()?
        };
        let listener: Listener = Listener::spawn_unicast(
            ListenerKind::Global,
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port),
            self.loop_context(),
        )?;
        pool.global = Some(listener);
        Ok(port)
    }

    /// Binds one listener per local IPv4 address, each on its own free port.
    ///
    /// Addresses that fail to bind are logged and skipped. Returns how many
    /// listeners were started by this call.
    pub fn start_per_interface(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut pool = self.pool();
        let mut started: usize = 0;

        for addr in local_ipv4_addresses() {
            if pool.has_interface(IpAddr::V4(addr)) {
                debug!("Already listening on {addr}");
                continue;
            }
            let port: u16 = match free_udp_port() {
                Ok(port) => port,
                Err(e) => {
                    warn!("No listener on {addr}: {e}");
                    continue;
                }
            };
            match Listener::spawn_unicast(
                ListenerKind::PerInterface,
                SocketAddrV4::new(addr, port),
                self.loop_context(),
            ) {
                Ok(listener) => {
                    pool.interfaces.push(listener);
                    started += 1;
                }
                Err(e) => warn!("No listener on {addr}: {e}"),
            }
        }
        Ok(started)
    }

    /// Joins `group` on every interface that has an IPv4 address.
    pub fn start_multicast(&self, group: SocketAddrV4) -> Result<()> {
        self.ensure_open()?;
        let mut pool = self.pool();
        if pool.multicast.is_some() {
            return Err(EngineError::AlreadyListening(ListenerKind::Multicast));
        }
        let listener: Listener =
            Listener::spawn_multicast(group, &multicast_members(), self.loop_context())?;
        pool.multicast = Some(listener);
        Ok(())
    }

    /// Local address of every listener, global first.
    pub fn listening_on(&self) -> Vec<(ListenerKind, SocketAddr)> {
        self.pool()
            .listeners()
            .map(|l| (l.kind(), l.local_addr()))
            .collect()
    }

    /// Sends the protocol's probe for `dest` from every active unicast listener.
    pub fn send(&self, dest: SocketAddr) -> Result<usize> {
        let data: Vec<u8> = self.protocol.build_outbound_packet(dest);
        self.send_bytes(dest, &data)
    }

    pub fn send_broadcast(&self, port: u16) -> Result<usize> {
        self.send(SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    pub fn send_multicast(&self, group: IpAddr, port: u16) -> Result<usize> {
        self.send(SocketAddr::new(group, port))
    }

    pub fn send_unicast(&self, addr: IpAddr, port: u16) -> Result<usize> {
        self.send(SocketAddr::new(addr, port))
    }

    /// Raises the protocol's own scan sequence.
    pub fn scan(&self) -> Result<()> {
        self.ensure_open()?;
        self.protocol.scan(self)
    }

    /// Sweeps every private subnet behind the active listeners, sending one
    /// probe to `port` on each host. A sweep already in flight is cancelled
    /// and awaited first.
    ///
    /// With a global listener the sweep covers every local IPv4 address and
    /// leaves from the global socket. Otherwise each per-interface listener
    /// sweeps its own subnet, skipping its own address.
    pub async fn active_scan(&self, port: u16) -> Result<()> {
        self.ensure_open()?;
        let jobs: Vec<SweepJob> = self.sweep_jobs()?;
        self.launch_sweep(jobs, port).await;
        Ok(())
    }

    /// Cancels and joins the running sweep, then starts one over `jobs`.
    async fn launch_sweep(&self, jobs: Vec<SweepJob>, port: u16) {
        let mut current = self.scan.lock().await;
        if let Some(previous) = current.take() {
            previous.cancel();
            let sent: usize = previous.join().await;
            debug!("Previous sweep stopped after {sent} probe(s)");
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = self.runtime.spawn(scanner::sweep(
            jobs,
            port,
            self.protocol.clone(),
            cancel_rx,
            self.closing.subscribe(),
        ));
        *current = Some(ScanHandle::new(cancel_tx, task));
    }

    /// Waits for the in-flight sweep and returns how many probes it sent.
    pub async fn wait_scan(&self) -> Option<usize> {
        let handle: ScanHandle = self.scan.lock().await.take()?;
        Some(handle.join().await)
    }

    pub fn is_scanning(&self) -> bool {
        match self.scan.try_lock() {
            Ok(current) => current.as_ref().is_some_and(|h| !h.is_finished()),
            // someone is replacing the sweep right now
            Err(_) => true,
        }
    }

    /// Cooperative shutdown: signal, then join the sweep and every receive loop.
    pub async fn stop_all(&self) {
        if self.closing.send_replace(true) {
            return;
        }

        if let Some(handle) = self.scan.lock().await.take() {
            handle.cancel();
            handle.join().await;
        }

        let listeners: Vec<Listener> = self.pool().drain();
        let count: usize = listeners.len();
        for listener in listeners {
            listener.join().await;
        }
        info!("Engine stopped, {count} listener(s) closed");
    }

    pub async fn shutdown(self) {
        self.stop_all().await;
    }

    fn sweep_jobs(&self) -> Result<Vec<SweepJob>> {
        let (global, interfaces) = {
            let pool = self.pool();
            (pool.global_sender(), pool.interface_senders())
        };
        let local: Vec<Ipv4Addr> = if global.is_some() {
            local_ipv4_addresses()
        } else {
            Vec::new()
        };
        scanner::assign_jobs(
            global,
            &interfaces,
            &local,
            subnet_mask_of,
            self.config.host_cap,
        )
        .ok_or(EngineError::NoListener)
    }

    fn loop_context(&self) -> LoopContext {
        let protocol: Arc<P> = self.protocol.clone();
        let inbound: Inbound = Arc::new(move |from: SocketAddr, data: &[u8]| {
            protocol.handle_inbound_packet(from, data)
        });
        LoopContext {
            runtime: self.runtime.clone(),
            closing: self.closing.subscribe(),
            inbound,
            buffer_size: self.config.recv_buffer_size,
        }
    }

    fn pool(&self) -> MutexGuard<'_, ListenerPool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        *self.closing.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<P: Protocol> Transmit for Engine<P> {
    fn send_bytes(&self, dest: SocketAddr, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let outlets: Vec<Outlet> = self.pool().senders();
        if outlets.is_empty() {
            return Err(EngineError::NoListener);
        }
        Ok(scanner::fan_out(&outlets, dest, data))
    }
}

impl<P: Protocol> Drop for Engine<P> {
    fn drop(&mut self) {
        self.closing.send_replace(true);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DeviceFound;
    use crate::network::pool::Datagram;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Echo {
        received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        scans: AtomicUsize,
    }

    impl Protocol for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn color(&self) -> u32 {
            0xFF00FF00
        }

        fn build_outbound_packet(&self, dest: SocketAddr) -> Vec<u8> {
            format!("probe {dest}").into_bytes()
        }

        fn handle_inbound_packet(&self, from: SocketAddr, data: &[u8]) {
            self.received.lock().unwrap().push((from, data.to_vec()));
        }

        fn scan(&self, transmit: &dyn Transmit) -> Result<()> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            transmit.send_bytes(SocketAddr::from((Ipv4Addr::LOCALHOST, 9)), b"scan")?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        labels: Mutex<Vec<(String, u32)>>,
    }

    impl ScannerViewer for Recorder {
        fn device_found(&self, _device: &DeviceFound) {}

        fn format_protocol(&self, name: &str, color: u32) {
            self.labels.lock().unwrap().push((name.to_string(), color));
        }
    }

    /// Records destinations instead of touching the network.
    #[derive(Debug, Default)]
    struct Captured {
        dests: Mutex<Vec<SocketAddr>>,
    }

    impl Datagram for Captured {
        fn send_datagram(&self, data: &[u8], dest: SocketAddr) -> io::Result<usize> {
            self.dests.lock().unwrap().push(dest);
            Ok(data.len())
        }
    }

    fn unicast_only() -> Config {
        Config {
            multicast: false,
            ..Config::default()
        }
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(matches!(
            Engine::new(Echo::default()),
            Err(EngineError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn send_without_listener_fails() {
        let engine = Engine::new(Echo::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(matches!(
            engine.send_unicast(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
            Err(EngineError::NoListener)
        ));
        assert!(matches!(engine.active_scan(9).await, Err(EngineError::NoListener)));
    }

    #[tokio::test]
    async fn start_global_returns_bound_port() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        let port = engine.start_global(0).unwrap();
        assert!(port >= 1024);
        assert_eq!(engine.state(), EngineState::Listening);
        assert_eq!(
            engine.listening_on(),
            vec![(ListenerKind::Global, SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))]
        );
        assert!(matches!(
            engine.start_global(0),
            Err(EngineError::AlreadyListening(ListenerKind::Global))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_global_rejects_port_in_use() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let engine = Engine::new(Echo::default()).unwrap();
        assert!(matches!(
            engine.start_global(port),
            Err(EngineError::PortInUse(p)) if p == port
        ));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn inbound_datagrams_reach_protocol() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        let port = engine.start_global(0).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"reply", ("127.0.0.1", port)).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while engine.protocol().received.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let received = engine.protocol().received.lock().unwrap().clone();
        assert_eq!(received, vec![(peer.local_addr().unwrap(), b"reply".to_vec())]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn send_unicast_uses_protocol_probe() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        engine.start_global(0).unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dest = peer.local_addr().unwrap();
        assert_eq!(engine.send_unicast(dest.ip(), dest.port()).unwrap(), 1);

        let mut buf = [0u8; 64];
        let (len, _) = timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], format!("probe {dest}").as_bytes());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn register_viewer_formats_protocol_label() {
        let engine = Engine::new(Echo::default()).unwrap();
        let viewer = Arc::new(Recorder::default());
        engine.register_viewer(viewer.clone());

        assert_eq!(
            *viewer.labels.lock().unwrap(),
            vec![("echo".to_string(), 0xFF00FF00)]
        );
        assert!(engine.viewer().is_some());
    }

    #[tokio::test]
    async fn scan_delegates_to_protocol() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        assert!(matches!(engine.scan(), Err(EngineError::NoListener)));
        engine.start_global(0).unwrap();
        engine.scan().unwrap();
        assert_eq!(engine.protocol().scans.load(Ordering::SeqCst), 2);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stop_all_closes_engine() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        engine.start_global(0).unwrap();
        timeout(Duration::from_secs(2), engine.stop_all()).await.unwrap();

        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine.listening_on().is_empty());
        assert!(matches!(engine.start_global(0), Err(EngineError::Closed)));
        assert!(matches!(
            engine.send_broadcast(9),
            Err(EngineError::Closed)
        ));
        // a second stop is a no-op
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn active_scan_with_global_listener_completes() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        engine.start_global(0).unwrap();

        engine.active_scan(9).await.unwrap();
        // a second scan replaces the first one
        engine.active_scan(9).await.unwrap();
        let sent = timeout(Duration::from_secs(30), engine.wait_scan()).await.unwrap();
        assert!(sent.is_some());
        assert!(!engine.is_scanning());
        assert_eq!(engine.wait_scan().await, None);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn per_interface_sweep_skips_own_address() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        let socket = Arc::new(Captured::default());
        let outlet = Outlet {
            kind: ListenerKind::PerInterface,
            local_addr: SocketAddr::from((Ipv4Addr::new(192, 168, 1, 50), 40000)),
            socket: socket.clone(),
        };
        let slash_24 = |_: Ipv4Addr| Ipv4Addr::new(255, 255, 255, 0);
        let jobs = scanner::assign_jobs(None, &[outlet], &[], slash_24, 254).unwrap();

        engine.launch_sweep(jobs, 5353).await;
        let sent = timeout(Duration::from_secs(5), engine.wait_scan()).await.unwrap();
        assert_eq!(sent, Some(253));

        let dests = socket.dests.lock().unwrap().clone();
        assert_eq!(dests.len(), 253);
        assert!(!dests.contains(&SocketAddr::from((Ipv4Addr::new(192, 168, 1, 50), 5353))));
        assert_eq!(dests[0], SocketAddr::from((Ipv4Addr::new(192, 168, 1, 1), 5353)));
        assert_eq!(dests[252], SocketAddr::from((Ipv4Addr::new(192, 168, 1, 254), 5353)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_per_interface_binds_local_addresses_once() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        let local = local_ipv4_addresses();

        let started = engine.start_per_interface().unwrap();
        assert!(started <= local.len());
        let listening = engine.listening_on();
        assert_eq!(listening.len(), started);
        for (kind, addr) in &listening {
            assert_eq!(*kind, ListenerKind::PerInterface);
            assert!(matches!(addr.ip(), IpAddr::V4(v4) if local.contains(&v4)));
        }

        // addresses already bound are skipped
        assert_eq!(engine.start_per_interface().unwrap(), 0);
        assert_eq!(engine.listening_on().len(), started);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn multicast_listener_receives_and_stops() {
        let engine = Engine::with_config(Echo::default(), unicast_only()).unwrap();
        let port = free_udp_port().unwrap();
        let group = SocketAddrV4::new(Ipv4Addr::new(239, 255, 77, 77), port);

        engine.start_multicast(group).unwrap();
        assert_eq!(engine.state(), EngineState::Listening);
        assert!(matches!(
            engine.start_multicast(group),
            Err(EngineError::AlreadyListening(ListenerKind::Multicast))
        ));
        // the multicast socket only receives
        assert!(matches!(
            engine.send_unicast(IpAddr::V4(Ipv4Addr::LOCALHOST), 9),
            Err(EngineError::NoListener)
        ));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"announce", ("127.0.0.1", port)).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while engine.protocol().received.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        timeout(Duration::from_secs(2), engine.stop_all()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Closed);
        assert!(engine.listening_on().is_empty());
    }
}
