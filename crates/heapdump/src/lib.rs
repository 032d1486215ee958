//! Heap snapshot capture for a process hosting a managed-memory VM.
//!
//! A [`Dumper`] walks the heap exposed through [`HeapSource`] and streams a
//! `.heapsnapshot` document to disk. Captures run either on the calling
//! thread or in a forked child ([`Flags::NO_FORK`]), and can be started with
//! [`Dumper::write_snapshot`] or by a signal ([`Flags::NO_SIGNAL`] clear).
//!
//! ```no_run
//! use std::sync::Arc;
//! use heapdump::{Dumper, ManagedHeap, SnapshotRequest};
//!
//! let heap = Arc::new(ManagedHeap::new());
//! let dumper = Dumper::from_env(heap)?;
//! let info = dumper.write_snapshot(SnapshotRequest::new()).wait()?;
//! println!("wrote {}", info.path.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
compile_error!(
    "heapdump needs fork(2), sigaction(2) and a known errno accessor; this target is not supported"
);

mod config;
mod dumper;
mod error;
mod graph;
mod isolation;
mod managed;
mod state;
mod trigger;
mod walker;

pub use config::{
    Config, DEFAULT_SIGNAL, DIR_ENV, FORK_FALLBACK_ENV, OPTIONS_ENV, SIGNAL_ENV,
};
pub use dumper::{Callback, Capture, Dumper, DumperBuilder, Origin, SnapshotInfo, SnapshotRequest};
pub use error::{CaptureError, ConfigError, VmStateError};
pub use graph::{HeapSource, HeapView, ObjectInfo, RefName, Reference};
pub use heapdump_types::{EdgeKind, Flags, NodeKind, ObjectId, format};
pub use isolation::{ForkFallback, Isolation};
pub use managed::{HeapError, ManagedHeap, ManagedView, Mutator};
pub use state::CaptureState;
pub use trigger::{handler_installed, parse_signal};
pub use walker::{CHUNK_SIZE, WalkPlan, WalkStats, write_snapshot_file};
