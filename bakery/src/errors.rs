use std::{fmt, io};
use shared_memory;

use crate::queue::QueueError;

#[derive(Debug)]
pub enum BakeryError {
    SharedMemory(shared_memory::ShmemError),
    Io(io::Error),
    // An OS call (sem_open, msgsnd, kill, ...) failed. Keeps the call name for the log line.
    Os { call: &'static str, source: io::Error },
    Queue(QueueError),
    SignalHook(io::Error),
    Config(String),
    Codec(String),
    // A blocking wait was abandoned because this process is shutting down.
    Cancelled,
    Logic(String),
}

impl BakeryError {
    pub(crate) fn last_os(call: &'static str) -> BakeryError {
        BakeryError::Os { call, source: io::Error::last_os_error() }
    }
}

impl fmt::Display for BakeryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BakeryError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            BakeryError::Io(e) => write!(f, "IO error: {}", e),
            BakeryError::Os { call, source } => write!(f, "{} failed: {}", call, source),
            BakeryError::Queue(e) => write!(f, "Queue error: {}", e),
            BakeryError::SignalHook(e) => write!(f, "Signal handling error: {}", e),
            BakeryError::Config(s) => write!(f, "Configuration error: {}", s),
            BakeryError::Codec(s) => write!(f, "Codec error: {}", s),
            BakeryError::Cancelled => write!(f, "Operation cancelled by shutdown"),
            BakeryError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for BakeryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BakeryError::SharedMemory(e) => Some(e),
            BakeryError::Io(e) => Some(e),
            BakeryError::Os { source, .. } => Some(source),
            BakeryError::Queue(e) => Some(e),
            BakeryError::SignalHook(e) => Some(e),
            BakeryError::Config(_) => None,
            BakeryError::Codec(_) => None,
            BakeryError::Cancelled => None,
            BakeryError::Logic(_) => None,
        }
    }
}

impl From<shared_memory::ShmemError> for BakeryError {
    fn from(err: shared_memory::ShmemError) -> Self {
        BakeryError::SharedMemory(err)
    }
}

impl From<io::Error> for BakeryError {
    fn from(err: io::Error) -> Self {
        BakeryError::Io(err)
    }
}

impl From<QueueError> for BakeryError {
    fn from(err: QueueError) -> Self {
        BakeryError::Queue(err)
    }
}

impl From<toml::de::Error> for BakeryError {
    fn from(err: toml::de::Error) -> Self {
        BakeryError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for BakeryError {
    fn from(err: toml::ser::Error) -> Self {
        BakeryError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BakeryError>;
