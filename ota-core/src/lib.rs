//! OTA Core - Hardware-independent streaming firmware update engine
//!
//! Downloads an image over a plain HTTP/1.0 connection, parses the response
//! framing incrementally and extracts the byte range of the device's target
//! slot out of a multi-slot image, handing it to a flash writer without ever
//! buffering the whole image. Everything here runs on the host as well as on
//! the device.

pub mod config;
pub mod error;
pub mod header;
pub mod net;
pub mod progress;
pub mod service;
pub mod session;
pub mod transport;

pub use config::OtaConfig;
pub use error::{ConfigError, FlashError, HeaderError, OtaError, TransportError};
pub use net::TcpConnection;
pub use progress::{Phase, ProgressLog, ProgressSink};
pub use service::{OtaService, UpdateGate, UpdatePermit, ViewerConfig, WatchOutcome};
pub use session::{SlotGeometry, State, SubRange, UpdateSession};
pub use transport::{build_request, Connection, DeviceReset, FlashWriter, UpdateReport, Updater};
