//! Error types for the sequencer core.

use std::fmt;

/// Errors raised by setup and control paths.
///
/// The real-time paths never produce these: short reads and writes are
/// reported as byte counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A ring buffer was requested with zero capacity.
    ZeroCapacity,
    /// A ring buffer was requested larger than the cursor arithmetic allows.
    CapacityTooLarge { requested: usize, max: usize },
    /// Storage for a ring buffer could not be allocated.
    Allocation { capacity: usize },
    /// Configuration values out of range.
    InvalidConfig(String),
    /// The command queue to the process thread is full.
    QueueFull,
    /// A track or step index outside the pattern.
    OutOfRange {
        what: &'static str,
        value: usize,
        len: usize,
    },
    /// I/O error.
    Io(String),
    /// JSON (de)serialization error.
    Serialize(String),
    /// The process thread could not be spawned or joined.
    Thread(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ZeroCapacity => write!(f, "ring buffer capacity must be positive"),
            Error::CapacityTooLarge { requested, max } => write!(
                f,
                "ring buffer capacity {} exceeds maximum of {}",
                requested, max
            ),
            Error::Allocation { capacity } => {
                write!(f, "failed to allocate {} bytes of ring storage", capacity)
            }
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            Error::QueueFull => write!(f, "command queue is full"),
            Error::OutOfRange { what, value, len } => {
                write!(f, "{} {} out of range (pattern has {})", what, value, len)
            }
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Serialize(msg) => write!(f, "serialization error: {}", msg),
            Error::Thread(msg) => write!(f, "process thread error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialize(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
