//! Outbound traffic: fan-out sends and active subnet sweeps.
//!
//! A sweep walks the private subnet behind each source address and sends the
//! protocol's probe to every host in it. At most one sweep runs per engine;
//! starting another one cancels and joins the previous task first.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use sweepr_common::network::interface::is_private_ipv4;
use sweepr_common::network::range::enumerate_hosts;
use sweepr_common::utils::hex::hexdump;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Level, debug, info, trace, warn};

use crate::discovery::Protocol;
use crate::network::pool::Outlet;

/// Sends `data` to `dest` from every outlet, skipping sockets that fail.
///
/// Returns the number of sockets the datagram left from.
pub(crate) fn fan_out(outlets: &[Outlet], dest: SocketAddr, data: &[u8]) -> usize {
    if tracing::enabled!(Level::TRACE) {
        trace!("Sending {} bytes to {dest}\n{}", data.len(), hexdump(data));
    }
    outlets
        .iter()
        .filter(|outlet| match outlet.socket.send_datagram(data, dest) {
            Ok(_) => {
                debug!("Sent from {} to {dest}", outlet.local_addr);
                true
            }
            Err(e) => {
                warn!("Send from {} ({}) to {dest} failed: {e}", outlet.local_addr, outlet.kind);
                false
            }
        })
        .count()
}

/// The hosts to probe behind one local address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub source: Ipv4Addr,
    pub targets: Vec<Ipv4Addr>,
}

/// Builds one plan per private source address.
///
/// Public sources are never swept. With `exclude_self` the source address is
/// dropped from its own target list.
pub fn plan_sweep(
    sources: &[Ipv4Addr],
    mask_of: impl Fn(Ipv4Addr) -> Ipv4Addr,
    host_cap: usize,
    exclude_self: bool,
) -> Vec<SweepPlan> {
    sources
        .iter()
        .filter(|source| {
            let private: bool = is_private_ipv4(**source);
            if !private {
                debug!("Not sweeping {source}: not a private address");
            }
            private
        })
        .map(|&source| {
            let mut targets: Vec<Ipv4Addr> = enumerate_hosts(source, mask_of(source), host_cap);
            if exclude_self {
                targets.retain(|target| *target != source);
            }
            SweepPlan { source, targets }
        })
        .collect()
}

/// A plan bound to the socket its probes leave from.
#[derive(Debug)]
pub(crate) struct SweepJob {
    pub outlet: Outlet,
    pub plan: SweepPlan,
}

/// Binds sweep plans to outlets. `None` when there is no outlet at all.
///
/// A global outlet sweeps the subnet of every address in `local`. Without
/// one, each interface outlet sweeps its own subnet minus its own address.
pub(crate) fn assign_jobs(
    global: Option<Outlet>,
    interfaces: &[Outlet],
    local: &[Ipv4Addr],
    mask_of: impl Fn(Ipv4Addr) -> Ipv4Addr,
    host_cap: usize,
) -> Option<Vec<SweepJob>> {
    if let Some(global) = global {
        let jobs = plan_sweep(local, mask_of, host_cap, false)
            .into_iter()
            .map(|plan| SweepJob {
                outlet: global.clone(),
                plan,
            })
            .collect();
        return Some(jobs);
    }
    if interfaces.is_empty() {
        return None;
    }

    let sources: Vec<Ipv4Addr> = interfaces.iter().filter_map(Outlet::source_ipv4).collect();
    let jobs = plan_sweep(&sources, mask_of, host_cap, true)
        .into_iter()
        .filter_map(|plan| {
            let outlet: Outlet = interfaces
                .iter()
                .find(|o| o.source_ipv4() == Some(plan.source))?
                .clone();
            Some(SweepJob { outlet, plan })
        })
        .collect();
    Some(jobs)
}

/// Sends one probe per target, stopping early once `cancel` or `closing` is set.
pub(crate) async fn sweep<P: Protocol>(
    jobs: Vec<SweepJob>,
    port: u16,
    protocol: Arc<P>,
    cancel: watch::Receiver<bool>,
    closing: watch::Receiver<bool>,
) -> usize {
    let mut sent: usize = 0;
    for job in jobs {
        debug!(
            "Sweeping {} host(s) behind {} from {}",
            job.plan.targets.len(),
            job.plan.source,
            job.outlet.local_addr
        );
        for target in job.plan.targets {
            if *cancel.borrow() || *closing.borrow() {
                debug!("Sweep cancelled after {sent} probe(s)");
                return sent;
            }
            let dest: SocketAddr = SocketAddr::from((target, port));
            let data: Vec<u8> = protocol.build_outbound_packet(dest);
            match job.outlet.socket.send_datagram(&data, dest) {
                Ok(_) => sent += 1,
                Err(e) => warn!("Probe from {} to {dest} failed: {e}", job.outlet.local_addr),
            }
            tokio::task::yield_now().await;
        }
    }
    info!("Sweep finished, {sent} probe(s) sent");
    sent
}

/// The in-flight sweep task and its cancel switch.
#[derive(Debug)]
pub(crate) struct ScanHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<usize>,
}

impl ScanHandle {
    pub fn new(cancel: watch::Sender<bool>, task: JoinHandle<usize>) -> Self {
        Self { cancel, task }
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task and returns the number of probes it sent.
    pub async fn join(self) -> usize {
        match self.task.await {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Sweep task ended abnormally: {e}");
                0
            }
        }
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
