use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use heapdump_types::{ObjectId, UnknownFlagBits};

/// Startup failures. These are the only errors allowed to abort
/// initialization.
#[derive(Debug)]
pub enum ConfigError {
    UnknownFlagBits(UnknownFlagBits),
    SignalInstall { signal: i32, source: io::Error },
    SignalAlreadyInstalled { signal: i32 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFlagBits(inner) => write!(f, "invalid capture flags: {inner}"),
            Self::SignalInstall { signal, source } => {
                write!(f, "failed to install handler for signal {signal}: {source}")
            }
            Self::SignalAlreadyInstalled { signal } => write!(
                f,
                "a heap snapshot signal handler is already installed for signal {signal}"
            ),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnknownFlagBits(inner) => Some(inner),
            Self::SignalInstall { source, .. } => Some(source),
            Self::SignalAlreadyInstalled { .. } => None,
        }
    }
}

impl From<UnknownFlagBits> for ConfigError {
    fn from(value: UnknownFlagBits) -> Self {
        Self::UnknownFlagBits(value)
    }
}

/// The host VM could not produce a consistent heap graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStateError {
    CollectionInProgress,
    DanglingRoot { root: ObjectId },
    DanglingReference { from: ObjectId, to: ObjectId },
    MalformedReference { from: ObjectId, detail: String },
    Unavailable(String),
}

impl fmt::Display for VmStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CollectionInProgress => {
                write!(f, "heap is mid-collection and cannot be walked")
            }
            Self::DanglingRoot { root } => write!(f, "root {root} does not name a live object"),
            Self::DanglingReference { from, to } => {
                write!(f, "{from} references {to}, which is not a live object")
            }
            Self::MalformedReference { from, detail } => {
                write!(f, "malformed reference from {from}: {detail}")
            }
            Self::Unavailable(detail) => write!(f, "heap unavailable: {detail}"),
        }
    }
}

impl Error for VmStateError {}

/// Per-request failure, delivered through the request's completion channel.
#[derive(Debug, Clone)]
pub enum CaptureError {
    Io { path: PathBuf, source: Arc<io::Error> },
    VmState(VmStateError),
    Fork(Arc<io::Error>),
    ConcurrentRequestRejected,
    /// The isolated worker died without reporting a result.
    WorkerExited { status: i32 },
    /// The isolated worker panicked during the walk.
    WorkerPanicked(String),
    /// The completion was dropped before an outcome was sent, e.g. because
    /// the request's callback panicked.
    Abandoned,
}

impl CaptureError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn fork(source: io::Error) -> Self {
        Self::Fork(Arc::new(source))
    }
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot write snapshot to {}: {source}", path.display())
            }
            Self::VmState(inner) => write!(f, "{inner}"),
            Self::Fork(source) => write!(f, "failed to fork snapshot worker: {source}"),
            Self::ConcurrentRequestRejected => {
                write!(f, "a heap snapshot is already in progress")
            }
            Self::WorkerExited { status } => write!(
                f,
                "snapshot worker exited without a report (wait status {status})"
            ),
            Self::WorkerPanicked(message) => write!(f, "snapshot worker panicked: {message}"),
            Self::Abandoned => write!(f, "snapshot capture ended without an outcome"),
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Fork(source) => Some(source.as_ref()),
            Self::VmState(inner) => Some(inner),
            Self::ConcurrentRequestRejected
            | Self::WorkerExited { .. }
            | Self::WorkerPanicked(_)
            | Self::Abandoned => None,
        }
    }
}

impl From<VmStateError> for CaptureError {
    fn from(value: VmStateError) -> Self {
        Self::VmState(value)
    }
}
