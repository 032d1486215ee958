//! Fork isolation: run a capture in a copy-on-write child and await its
//! structured result.
//!
//! The parent pauses the heap, forks, and resumes mutation as soon as `fork`
//! returns. The child walks its private image of the paused heap, writes the
//! file, sends a JSON [`WorkerReport`] down a pipe and leaves through `_exit`
//! so no destructors or exit hooks of the parent run twice. The child must not
//! log: another parent thread may have held the subscriber's locks at fork
//! time.

use std::any::Any;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::{CaptureError, VmStateError};
use crate::graph::HeapView;
use crate::walker::{self, WalkStats};

/// Where a capture ran.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Isolation {
    InProcess,
    Forked,
}

/// What to do when `fork` itself fails.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ForkFallback {
    /// Walk in the calling process instead.
    #[default]
    InProcess,
    /// Report [`CaptureError::Fork`].
    Fail,
}

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_NO_REPORT: i32 = 2;

#[derive(Facet, Debug)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
enum WorkerFailure {
    Io(String),
    VmState(String),
    Panicked(String),
}

#[derive(Facet, Debug)]
struct WorkerReport {
    nodes: u64,
    edges: u64,
    bytes: u64,
    failure: Option<WorkerFailure>,
}

impl WorkerReport {
    fn from_outcome(outcome: &Result<WalkStats, CaptureError>) -> Self {
        match outcome {
            Ok(stats) => Self {
                nodes: stats.nodes,
                edges: stats.edges,
                bytes: stats.bytes,
                failure: None,
            },
            Err(err) => Self::failed(match err {
                CaptureError::Io { source, .. } => WorkerFailure::Io(source.to_string()),
                other => WorkerFailure::VmState(other.to_string()),
            }),
        }
    }

    fn failed(failure: WorkerFailure) -> Self {
        Self {
            nodes: 0,
            edges: 0,
            bytes: 0,
            failure: Some(failure),
        }
    }

    fn into_outcome(self, path: &Path) -> Result<WalkStats, CaptureError> {
        match self.failure {
            None => Ok(WalkStats {
                nodes: self.nodes,
                edges: self.edges,
                bytes: self.bytes,
            }),
            Some(WorkerFailure::Io(detail)) => Err(CaptureError::io(path, io::Error::other(detail))),
            Some(WorkerFailure::VmState(detail)) => {
                Err(CaptureError::VmState(VmStateError::Unavailable(detail)))
            }
            Some(WorkerFailure::Panicked(message)) => Err(CaptureError::WorkerPanicked(message)),
        }
    }
}

/// A forked capture still running.
#[derive(Debug)]
pub(crate) struct Worker {
    pid: libc::pid_t,
    report: File,
    path: PathBuf,
}

fn pipe_cloexec() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // Own both ends first so they close on every error path below.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok((read, write))
}

/// A fork that did not happen. Hands the paused view and the destination back
/// so the caller can fall back to an in-process walk.
pub(crate) struct SpawnError<V> {
    pub(crate) view: V,
    pub(crate) destination: File,
    pub(crate) source: io::Error,
}

/// Forks a worker that captures `view` into `destination`, already created
/// at `path`.
///
/// `view` is consumed: the parent drops it (resuming the heap) right after
/// the fork, the child keeps its copy until it exits. On error nothing has
/// been forked and the view comes back to the caller.
pub(crate) fn spawn<V: HeapView>(
    view: V,
    destination: File,
    path: &Path,
) -> Result<Worker, SpawnError<V>> {
    let (read_end, write_end) = match pipe_cloexec() {
        Ok(ends) => ends,
        Err(source) => {
            return Err(SpawnError {
                view,
                destination,
                source,
            });
        }
    };

    #[cfg(test)]
    {
        if let Some(source) = forced_fork_failure() {
            return Err(SpawnError {
                view,
                destination,
                source,
            });
        }
    }

    match unsafe { libc::fork() } {
        -1 => Err(SpawnError {
            view,
            destination,
            source: io::Error::last_os_error(),
        }),
        0 => {
            drop(read_end);
            // Every path out of the child ends in `_exit`; an unwind must
            // never reach the caller's frames in this copy of the process.
            let code = panic::catch_unwind(AssertUnwindSafe(|| {
                run_worker(view, destination, path, write_end)
            }))
            .unwrap_or(EXIT_NO_REPORT);
            unsafe { libc::_exit(code) }
        }
        pid => {
            drop(view);
            drop(destination);
            drop(write_end);
            Ok(Worker {
                pid,
                report: File::from(read_end),
                path: path.to_path_buf(),
            })
        }
    }
}

/// Body of the forked child. Returns the exit code.
fn run_worker<V: HeapView>(view: V, destination: File, path: &Path, channel: OwnedFd) -> i32 {
    unsafe {
        libc::setsid();
    }
    // The default hook writes to stderr, whose lock may have been held by
    // another parent thread at fork time.
    panic::set_hook(Box::new(|_| {}));

    let walked = panic::catch_unwind(AssertUnwindSafe(|| {
        walker::write_to_destination(&view, destination, path, &mut |_| {})
    }));
    let report = match &walked {
        Ok(outcome) => WorkerReport::from_outcome(outcome),
        Err(payload) => {
            let _ = std::fs::remove_file(path);
            WorkerReport::failed(WorkerFailure::Panicked(panic_message(payload.as_ref())))
        }
    };

    let Ok(bytes) = facet_json::to_vec(&report) else {
        return EXIT_NO_REPORT;
    };
    match File::from(channel).write_all(&bytes) {
        Ok(()) if report.failure.is_none() => EXIT_OK,
        Ok(()) => EXIT_FAILED,
        Err(_) => EXIT_NO_REPORT,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
thread_local! {
    static FORK_FAILURE: std::cell::Cell<Option<i32>> = const { std::cell::Cell::new(None) };
}

/// Makes the next `spawn` on this thread fail as if `fork` returned `errno`.
#[cfg(test)]
pub(crate) fn fail_next_fork(errno: i32) {
    FORK_FAILURE.with(|failure| failure.set(Some(errno)));
}

#[cfg(test)]
fn forced_fork_failure() -> Option<io::Error> {
    FORK_FAILURE
        .with(|failure| failure.take())
        .map(io::Error::from_raw_os_error)
}

impl Worker {
    pub(crate) fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Blocks until the child has exited and turns its report into the
    /// capture outcome.
    pub(crate) fn wait(mut self) -> Result<WalkStats, CaptureError> {
        let mut buf = Vec::new();
        let read = self.report.read_to_end(&mut buf);
        let status = reap(self.pid);

        let report = match read {
            Ok(_) if !buf.is_empty() => facet_json::from_slice::<WorkerReport>(&buf).ok(),
            _ => None,
        };
        let Some(report) = report else {
            // The child died mid-walk; whatever it wrote is unusable.
            let _ = std::fs::remove_file(&self.path);
            return Err(match status {
                Ok(Some(status)) => CaptureError::WorkerExited { status },
                Ok(None) => CaptureError::WorkerExited { status: -1 },
                Err(err) => CaptureError::fork(err),
            });
        };
        report.into_outcome(&self.path)
    }
}

/// `Ok(None)` when the child was already reaped elsewhere, e.g. because the
/// host ignores `SIGCHLD`.
fn reap(pid: libc::pid_t) -> io::Result<Option<libc::c_int>> {
    loop {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == pid {
            return Ok(Some(status));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ECHILD) => return Ok(None),
            _ => return Err(err),
        }
    }
}
