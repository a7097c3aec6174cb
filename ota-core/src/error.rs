// Error taxonomy for a single update attempt

use std::fmt;
use std::io::ErrorKind;

/// Malformed or missing response framing. Aborts the attempt without a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    MissingContentLength,
    MalformedContentLength,
    /// The header block did not fit into the receive buffer.
    HeaderTooLarge { limit: usize },
    /// Too few body bytes to give every slot at least one byte.
    ImageTooSmall { content_length: u64, total_slots: u8 },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::MissingContentLength => write!(f, "did not parse Content-Length item"),
            HeaderError::MalformedContentLength => write!(f, "malformed Content-Length value"),
            HeaderError::HeaderTooLarge { limit } => {
                write!(f, "http header exceeds {} byte receive buffer", limit)
            }
            HeaderError::ImageTooSmall { content_length, total_slots } => write!(
                f,
                "image of {} bytes cannot be split into {} slots",
                content_length, total_slots
            ),
        }
    }
}

impl std::error::Error for HeaderError {}

/// Socket-level failure. Aborts the attempt without a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Resolve,
    Connect(ErrorKind),
    Send(ErrorKind),
    Receive(ErrorKind),
    /// No bytes arrived within the receive timeout.
    Timeout,
    /// Peer closed the connection before the target slot was complete.
    PrematureClose { body_bytes_seen: u64 },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Resolve => write!(f, "could not resolve update server address"),
            TransportError::Connect(kind) => write!(f, "connect to server failed: {:?}", kind),
            TransportError::Send(kind) => write!(f, "send GET request failed: {:?}", kind),
            TransportError::Receive(kind) => write!(f, "receive data error: {:?}", kind),
            TransportError::Timeout => write!(f, "timed out waiting for data"),
            TransportError::PrematureClose { body_bytes_seen } => write!(
                f,
                "connection closed after {} body bytes, before the slot was complete",
                body_bytes_seen
            ),
        }
    }
}

impl std::error::Error for TransportError {}

/// Flash writer failure, carrying the platform error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    Begin(i32),
    Write(i32),
    End(i32),
    SetBootPartition(i32),
}

impl FlashError {
    /// Begin fails before anything touched the partition.
    pub fn partition_touched(&self) -> bool {
        !matches!(self, FlashError::Begin(_))
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashError::Begin(code) => write!(f, "ota begin failed, error=0x{:x}", code),
            FlashError::Write(code) => write!(f, "ota write failed, error=0x{:x}", code),
            FlashError::End(code) => write!(f, "ota end failed, error=0x{:x}", code),
            FlashError::SetBootPartition(code) => {
                write!(f, "set boot partition failed, error=0x{:x}", code)
            }
        }
    }
}

impl std::error::Error for FlashError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    EmptyHost,
    ZeroPort,
    InvalidPath(String),
    ChunkSize(usize),
    ZeroReceiveTimeout,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyHost => write!(f, "update server host is empty"),
            ConfigError::ZeroPort => write!(f, "update server port must be non-zero"),
            ConfigError::InvalidPath(path) => write!(f, "image path '{}' must start with '/'", path),
            ConfigError::ChunkSize(size) => {
                write!(f, "chunk size {} outside supported range 256..=4096", size)
            }
            ConfigError::ZeroReceiveTimeout => write!(f, "receive timeout must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    Header(HeaderError),
    Transport(TransportError),
    Flash(FlashError),
    InvalidGeometry { total_slots: u8, target_slot: u8 },
    /// An update is already in flight; no second session was created.
    ReentrancyRejected,
    TaskSpawn(ErrorKind),
}

impl OtaError {
    /// Whether the device must be reset after this failure.
    pub fn requires_reset(&self) -> bool {
        matches!(self, OtaError::Flash(e) if e.partition_touched())
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::Header(e) => write!(f, "header error: {}", e),
            OtaError::Transport(e) => write!(f, "transport error: {}", e),
            OtaError::Flash(e) => write!(f, "flash error: {}", e),
            OtaError::InvalidGeometry { total_slots, target_slot } => write!(
                f,
                "target slot {} is not within {} update slots",
                target_slot, total_slots
            ),
            OtaError::ReentrancyRejected => write!(f, "an update is already in progress"),
            OtaError::TaskSpawn(kind) => write!(f, "could not spawn update task: {:?}", kind),
        }
    }
}

impl std::error::Error for OtaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OtaError::Header(e) => Some(e),
            OtaError::Transport(e) => Some(e),
            OtaError::Flash(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HeaderError> for OtaError {
    fn from(e: HeaderError) -> Self {
        OtaError::Header(e)
    }
}

impl From<TransportError> for OtaError {
    fn from(e: TransportError) -> Self {
        OtaError::Transport(e)
    }
}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        OtaError::Flash(e)
    }
}
