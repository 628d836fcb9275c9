pub mod discovery;
pub mod engine;
pub mod error;
pub mod mdns;
pub mod network;
pub mod scanner;

pub use discovery::{DeviceFound, Protocol, ScannerViewer, Transmit};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, Result};
pub use mdns::Mdns;
