//! # Discovery contracts
//!
//! The seams between the engine, the protocols it hosts and whatever renders
//! the results.
//!
//! - A [`Protocol`] turns destinations into probe bytes and consumes replies.
//! - A [`Transmit`] is anything that can put bytes on the wire; the engine is one.
//! - A [`ScannerViewer`] is told about every identified device.

use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use crate::error::Result;

/// A discovery protocol hosted by an [`Engine`](crate::Engine).
///
/// `handle_inbound_packet` runs on a listener's receive task and must not block.
pub trait Protocol: Send + Sync + 'static {
    /// Label shown next to devices found by this protocol.
    fn name(&self) -> &str;

    /// ARGB color of the label.
    fn color(&self) -> u32;

    /// The group and port this protocol listens on, if it is multicast based.
    fn multicast_group(&self) -> Option<SocketAddrV4> {
        None
    }

    /// The probe sent to `dest` by broadcasts, fan-out sends and subnet sweeps.
    fn build_outbound_packet(&self, dest: SocketAddr) -> Vec<u8>;

    /// Called with every datagram any listener receives.
    fn handle_inbound_packet(&self, from: SocketAddr, data: &[u8]);

    /// Re-runs the protocol's own query sequence, e.g. when a viewer asks for a refresh.
    fn scan(&self, _transmit: &dyn Transmit) -> Result<()> {
        Ok(())
    }
}

pub trait Transmit: Send + Sync {
    /// Sends `data` to `dest` from every active unicast listener.
    ///
    /// Returns how many sockets accepted the datagram.
    fn send_bytes(&self, dest: SocketAddr, data: &[u8]) -> Result<usize>;
}

pub trait ScannerViewer: Send + Sync {
    fn device_found(&self, device: &DeviceFound);

    /// Called once when the viewer is registered with an engine.
    fn format_protocol(&self, name: &str, color: u32);
}

/// A positively identified device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound {
    pub protocol: String,
    pub version: u32,
    pub address: IpAddr,
    pub device_type: String,
    pub serial: String,
}
