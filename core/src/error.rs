use std::io;
use std::net::SocketAddr;

use sweepr_common::network::port::PortError;
use sweepr_protocols::dns::CodecError;
use thiserror::Error;

use crate::network::listener::ListenerKind;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("UDP port {0} is already in use")]
    PortInUse(u16),

    #[error("no free UDP port in {start}..{end}")]
    PortExhaustion { start: u16, end: u16 },

    /// Sending or scanning before any unicast listener was started.
    #[error("no listener started, call start_global() or start_per_interface() first")]
    NoListener,

    #[error("{0} listener is already running")]
    AlreadyListening(ListenerKind),

    #[error("failed to bind UDP socket on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("engine is shut down")]
    Closed,

    #[error("engine must be created from within a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<PortError> for EngineError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::InUse(port) => EngineError::PortInUse(port),
            PortError::Exhausted { start, end } => EngineError::PortExhaustion { start, end },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
