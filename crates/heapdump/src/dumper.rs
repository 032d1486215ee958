use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use facet::Facet;
use heapdump_types::Flags;
use heapdump_types::format::FILE_EXTENSION;
use tokio::sync::oneshot;

use crate::config::Config;
use crate::error::{CaptureError, ConfigError};
use crate::graph::HeapSource;
use crate::isolation::{self, ForkFallback, Isolation, SpawnError, Worker};
use crate::state::{CaptureCell, CaptureState};
use crate::trigger::SignalTrigger;
use crate::walker::{self, WalkStats};

/// Invoked exactly once with the outcome of a request.
pub type Callback = Box<dyn FnOnce(Result<SnapshotInfo, CaptureError>) + Send + 'static>;

/// What started a capture.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Origin {
    Api,
    Signal,
}

/// One capture request. Without a path the dumper picks a unique one in its
/// output directory.
pub struct SnapshotRequest {
    path: Option<PathBuf>,
    on_complete: Option<Callback>,
    origin: Origin,
}

impl SnapshotRequest {
    pub fn new() -> Self {
        Self {
            path: None,
            on_complete: None,
            origin: Origin::Api,
        }
    }

    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl FnOnce(Result<SnapshotInfo, CaptureError>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    fn from_signal() -> Self {
        Self {
            origin: Origin::Signal,
            ..Self::new()
        }
    }
}

impl Default for SnapshotRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotRequest")
            .field("path", &self.path)
            .field("on_complete", &self.on_complete.is_some())
            .field("origin", &self.origin)
            .finish()
    }
}

/// A successfully written snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub nodes: u64,
    pub edges: u64,
    pub bytes: u64,
    pub isolation: Isolation,
}

/// Handle to a capture. The path is known immediately; the outcome once the
/// file is closed.
#[derive(Debug)]
pub struct Capture {
    path: PathBuf,
    outcome: oneshot::Receiver<Result<SnapshotInfo, CaptureError>>,
}

impl Capture {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks the current thread until the capture finishes. Must not be
    /// called from inside an async runtime; use [`Capture::finished`] there.
    pub fn wait(self) -> Result<SnapshotInfo, CaptureError> {
        self.outcome
            .blocking_recv()
            .unwrap_or(Err(CaptureError::Abandoned))
    }

    pub async fn finished(self) -> Result<SnapshotInfo, CaptureError> {
        self.outcome.await.unwrap_or(Err(CaptureError::Abandoned))
    }
}

/// A request that has been accepted and owns the walker.
struct Pending {
    path: PathBuf,
    origin: Origin,
    on_complete: Option<Callback>,
    done: oneshot::Sender<Result<SnapshotInfo, CaptureError>>,
    started: Instant,
}

impl Pending {
    fn deliver(self, outcome: Result<SnapshotInfo, CaptureError>) {
        if let Some(callback) = self.on_complete {
            callback(outcome.clone());
        }
        let _ = self.done.send(outcome);
    }
}

/// Shared by every dumper so two of them writing to one directory in the same
/// microsecond still pick different names.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

struct Inner<H> {
    heap: Arc<H>,
    config: Config,
    cell: CaptureCell,
    signal: Option<i32>,
}

/// The capture service for one heap.
///
/// Cheap to clone; clones share the in-flight state, so at most one capture
/// runs at a time across all of them.
pub struct Dumper<H: HeapSource> {
    inner: Arc<Inner<H>>,
}

impl<H: HeapSource> Clone for Dumper<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: HeapSource> fmt::Debug for Dumper<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dumper")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("signal", &self.inner.signal)
            .finish()
    }
}

pub struct DumperBuilder<H> {
    heap: Arc<H>,
    config: Config,
    flag_bits: Option<u32>,
}

impl<H: HeapSource> DumperBuilder<H> {
    /// Replaces every setting at once, e.g. with [`Config::from_env`].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self.flag_bits = None;
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.config.flags = flags;
        self.flag_bits = None;
        self
    }

    /// Raw flag bits; unknown bits fail [`DumperBuilder::build`].
    pub fn flag_bits(mut self, bits: u32) -> Self {
        self.flag_bits = Some(bits);
        self
    }

    pub fn signal(mut self, signal: i32) -> Self {
        self.config.signal = signal;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn fork_fallback(mut self, fallback: ForkFallback) -> Self {
        self.config.fork_fallback = fallback;
        self
    }

    /// Fixes the flags and, unless `NO_SIGNAL` is set, installs the signal
    /// trigger and starts its watcher thread.
    pub fn build(self) -> Result<Dumper<H>, ConfigError> {
        let mut config = self.config;
        if let Some(bits) = self.flag_bits {
            config.flags = Flags::from_bits(bits)?;
        }

        let trigger = if config.flags.no_signal() {
            None
        } else {
            Some(SignalTrigger::install(config.signal)?)
        };

        let dumper = Dumper {
            inner: Arc::new(Inner {
                heap: self.heap,
                signal: trigger.as_ref().map(SignalTrigger::signal),
                config,
                cell: CaptureCell::new(),
            }),
        };

        if let Some(trigger) = trigger {
            let signal = trigger.signal();
            spawn_watcher(dumper.clone(), trigger)
                .map_err(|source| ConfigError::SignalInstall { signal, source })?;
        }

        tracing::info!(
            flags = %dumper.inner.config.flags,
            signal = ?dumper.inner.signal,
            output_dir = %dumper.inner.config.output_dir.display(),
            "heap snapshot service configured"
        );
        Ok(dumper)
    }
}

fn spawn_watcher<H: HeapSource>(dumper: Dumper<H>, trigger: SignalTrigger) -> std::io::Result<()> {
    thread::Builder::new()
        .name("heapdump-signal".into())
        .spawn(move || {
            loop {
                match trigger.wait() {
                    Ok(count) => {
                        tracing::debug!(signal = trigger.signal(), count, "snapshot signal received");
                        dumper.write_snapshot(SnapshotRequest::from_signal());
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "signal watcher stopped");
                        return;
                    }
                }
            }
        })?;
    Ok(())
}

impl<H: HeapSource> Dumper<H> {
    pub fn builder(heap: Arc<H>) -> DumperBuilder<H> {
        DumperBuilder {
            heap,
            config: Config::default(),
            flag_bits: None,
        }
    }

    /// Shorthand for a builder with default settings and the given flags.
    pub fn configure(heap: Arc<H>, flags: Flags) -> Result<Self, ConfigError> {
        Self::builder(heap).flags(flags).build()
    }

    /// Configures from the `HEAPDUMP_*` environment variables.
    pub fn from_env(heap: Arc<H>) -> Result<Self, ConfigError> {
        Self::builder(heap).config(Config::from_env()).build()
    }

    pub fn flags(&self) -> Flags {
        self.inner.config.flags
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn heap(&self) -> &Arc<H> {
        &self.inner.heap
    }

    /// The signal with an installed trigger, if any.
    pub fn signal(&self) -> Option<i32> {
        self.inner.signal
    }

    /// State of the latest accepted capture.
    pub fn state(&self) -> CaptureState {
        self.inner.cell.get()
    }

    /// Starts a capture and returns its handle.
    ///
    /// With `NO_FORK` set the walk runs on this thread and the callback has
    /// run by the time this returns. Otherwise the walk runs in a forked child
    /// and completion happens on a reaper thread. A request made while
    /// another capture is in flight is rejected with
    /// [`CaptureError::ConcurrentRequestRejected`].
    pub fn write_snapshot(&self, request: SnapshotRequest) -> Capture {
        let path = request.path.unwrap_or_else(|| self.next_path());
        let (done, outcome) = oneshot::channel();
        let capture = Capture {
            path: path.clone(),
            outcome,
        };
        let pending = Pending {
            path,
            origin: request.origin,
            on_complete: request.on_complete,
            done,
            started: Instant::now(),
        };

        if let Err(current) = self.inner.cell.try_begin() {
            match pending.origin {
                Origin::Signal => {
                    tracing::debug!(state = ?current, "snapshot signal coalesced into capture in flight")
                }
                Origin::Api => tracing::warn!(
                    path = %pending.path.display(),
                    state = ?current,
                    "snapshot request rejected: capture in flight"
                ),
            }
            pending.deliver(Err(CaptureError::ConcurrentRequestRejected));
            return capture;
        }

        tracing::debug!(
            path = %pending.path.display(),
            origin = ?pending.origin,
            "snapshot requested"
        );
        if self.inner.config.flags.no_fork() {
            let outcome = self.capture_in_process(&pending.path);
            self.complete(pending, outcome.map(|stats| (stats, Isolation::InProcess)));
        } else {
            self.capture_forked(pending);
        }
        capture
    }

    fn next_path(&self) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        self.inner.config.output_dir.join(format!(
            "heapdump-{}.{}.{:06}.{}.{}",
            std::process::id(),
            now.as_secs(),
            now.subsec_micros(),
            seq,
            FILE_EXTENSION
        ))
    }

    fn capture_in_process(&self, path: &Path) -> Result<WalkStats, CaptureError> {
        let destination = walker::create_destination(path)?;
        let view = match self.inner.heap.pause() {
            Ok(view) => view,
            Err(err) => {
                drop(destination);
                let _ = std::fs::remove_file(path);
                return Err(err.into());
            }
        };
        walker::write_to_destination(&view, destination, path, &mut |state| {
            self.inner.cell.advance(state)
        })
    }

    fn capture_forked(&self, pending: Pending) {
        let destination = match walker::create_destination(&pending.path) {
            Ok(file) => file,
            Err(err) => return self.complete(pending, Err(err)),
        };
        let view = match self.inner.heap.pause() {
            Ok(view) => view,
            Err(err) => {
                drop(destination);
                let _ = std::fs::remove_file(&pending.path);
                return self.complete(pending, Err(err.into()));
            }
        };

        match isolation::spawn(view, destination, &pending.path) {
            Ok(worker) => {
                self.inner.cell.advance(CaptureState::Walking);
                tracing::debug!(pid = worker.pid(), path = %pending.path.display(), "snapshot worker forked");
                self.reap_in_background(worker, pending);
            }
            Err(SpawnError {
                view,
                destination,
                source,
            }) => match self.inner.config.fork_fallback {
                ForkFallback::InProcess => {
                    tracing::warn!(error = %source, "fork failed, capturing in process");
                    let outcome =
                        walker::write_to_destination(&view, destination, &pending.path, &mut |state| {
                            self.inner.cell.advance(state)
                        });
                    drop(view);
                    self.complete(pending, outcome.map(|stats| (stats, Isolation::InProcess)));
                }
                ForkFallback::Fail => {
                    drop(view);
                    drop(destination);
                    let _ = std::fs::remove_file(&pending.path);
                    self.complete(pending, Err(CaptureError::fork(source)));
                }
            },
        }
    }

    fn reap_in_background(&self, worker: Worker, pending: Pending) {
        let (handoff, receive) = mpsc::channel::<(Worker, Pending)>();
        let dumper = self.clone();
        let spawned = thread::Builder::new()
            .name("heapdump-reaper".into())
            .spawn(move || {
                if let Ok((worker, pending)) = receive.recv() {
                    dumper.reap(worker, pending);
                }
            });

        let unclaimed = match spawned {
            Ok(_) => handoff.send((worker, pending)).err().map(|e| e.0),
            Err(err) => {
                tracing::warn!(error = %err, "no reaper thread, waiting for worker inline");
                Some((worker, pending))
            }
        };
        if let Some((worker, pending)) = unclaimed {
            self.reap(worker, pending);
        }
    }

    fn reap(&self, worker: Worker, pending: Pending) {
        let outcome = worker.wait();
        self.complete(pending, outcome.map(|stats| (stats, Isolation::Forked)));
    }

    fn complete(&self, pending: Pending, outcome: Result<(WalkStats, Isolation), CaptureError>) {
        let elapsed_ms = pending.started.elapsed().as_millis() as u64;
        let outcome = match outcome {
            Ok((stats, isolation)) => {
                self.inner.cell.advance(CaptureState::Completed);
                tracing::info!(
                    path = %pending.path.display(),
                    nodes = stats.nodes,
                    edges = stats.edges,
                    bytes = stats.bytes,
                    isolation = ?isolation,
                    origin = ?pending.origin,
                    elapsed_ms,
                    "heap snapshot written"
                );
                Ok(SnapshotInfo {
                    path: pending.path.clone(),
                    nodes: stats.nodes,
                    edges: stats.edges,
                    bytes: stats.bytes,
                    isolation,
                })
            }
            Err(err) => {
                self.inner.cell.advance(CaptureState::Failed);
                tracing::warn!(
                    path = %pending.path.display(),
                    origin = ?pending.origin,
                    elapsed_ms,
                    error = %err,
                    "heap snapshot failed"
                );
                Err(err)
            }
        };
        pending.deliver(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VmStateError;
    use crate::managed::{ManagedHeap, ManagedView};
    use heapdump_types::NodeKind;
    use heapdump_types::format::SnapshotDocument;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn in_process() -> Flags {
        Flags::empty().with(Flags::NO_FORK).with(Flags::NO_SIGNAL)
    }

    fn small_heap() -> Arc<ManagedHeap> {
        let heap = ManagedHeap::new();
        heap.mutate(|m| {
            let global = m.alloc(NodeKind::Object, "Global", 64).expect("alloc");
            let name = m.alloc(NodeKind::String, "service", 16).expect("alloc");
            m.add_root(global).expect("root");
            m.set_property(global, "name", name).expect("set");
        });
        Arc::new(heap)
    }

    fn dumper_in(dir: &Path, heap: Arc<ManagedHeap>) -> Dumper<ManagedHeap> {
        Dumper::builder(heap)
            .flags(in_process())
            .output_dir(dir)
            .build()
            .expect("configure")
    }

    fn assert_valid_snapshot(path: &Path, nodes: u64) {
        let text = std::fs::read_to_string(path).expect("read snapshot");
        let doc = SnapshotDocument::parse(&text).expect("valid snapshot");
        assert_eq!(doc.node_count() as u64, nodes);
    }

    #[test]
    fn sequential_captures_get_distinct_valid_files_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = dumper_in(dir.path(), small_heap());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut captures = Vec::new();
        for n in 0..2 {
            let order = Arc::clone(&order);
            let capture = dumper.write_snapshot(
                SnapshotRequest::new().on_complete(move |outcome| {
                    assert!(outcome.is_ok());
                    order.lock().push(n);
                }),
            );
            captures.push(capture);
        }

        assert_eq!(*order.lock(), vec![0, 1]);
        assert_ne!(captures[0].path(), captures[1].path());
        for capture in captures {
            let path = capture.path().to_path_buf();
            let info = capture.wait().expect("capture succeeds");
            assert_eq!(info.path, path);
            assert_eq!(info.isolation, Isolation::InProcess);
            assert_eq!(info.nodes, 3);
            assert_valid_snapshot(&path, 3);
        }
        assert_eq!(dumper.state(), CaptureState::Completed);
    }

    #[test]
    fn generated_paths_carry_pid_and_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = dumper_in(dir.path(), small_heap());
        let path = dumper.next_path();
        assert_eq!(path.parent(), Some(dir.path()));
        let name = path.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
        assert!(name.starts_with(&format!("heapdump-{}.", std::process::id())), "{name}");
        assert!(name.ends_with(".heapsnapshot"), "{name}");
        assert_ne!(dumper.next_path(), path);
    }

    fn seq_of(path: &Path) -> u64 {
        let name = path.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
        name.split('.').nth(3).expect("seq component").parse().expect("numeric seq")
    }

    #[test]
    fn dumpers_sharing_a_directory_never_share_a_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dumper_in(dir.path(), small_heap());
        let second = dumper_in(dir.path(), small_heap());

        let a = first.next_path();
        let b = second.next_path();
        let c = first.next_path();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(seq_of(&a) < seq_of(&b), "{a:?} {b:?}");
        assert!(seq_of(&b) < seq_of(&c), "{b:?} {c:?}");
    }

    #[test]
    fn fork_failure_falls_back_to_in_process_walk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = Dumper::builder(small_heap())
            .flags(Flags::parse_options("fork,nosignal").flags)
            .fork_fallback(ForkFallback::InProcess)
            .output_dir(dir.path())
            .build()
            .expect("configure");

        isolation::fail_next_fork(libc::EAGAIN);
        let capture = dumper.write_snapshot(SnapshotRequest::new());
        let path = capture.path().to_path_buf();
        let info = capture.wait().expect("fallback capture succeeds");
        assert_eq!(info.isolation, Isolation::InProcess);
        assert_eq!(info.nodes, 3);
        assert_valid_snapshot(&path, 3);
        assert_eq!(dumper.state(), CaptureState::Completed);
    }

    #[test]
    fn fork_failure_with_fail_policy_reports_fork_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = Dumper::builder(small_heap())
            .flags(Flags::parse_options("fork,nosignal").flags)
            .fork_fallback(ForkFallback::Fail)
            .output_dir(dir.path())
            .build()
            .expect("configure");

        isolation::fail_next_fork(libc::EAGAIN);
        let capture = dumper.write_snapshot(SnapshotRequest::new());
        let path = capture.path().to_path_buf();
        match capture.wait() {
            Err(CaptureError::Fork(source)) => {
                assert_eq!(source.raw_os_error(), Some(libc::EAGAIN));
            }
            other => panic!("expected a fork error, got {other:?}"),
        }
        assert!(!path.exists(), "no partial file after a failed fork");
        assert_eq!(dumper.state(), CaptureState::Failed);
    }

    #[test]
    fn callback_runs_once_before_in_process_capture_returns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = dumper_in(dir.path(), small_heap());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let path = dir.path().join("explicit.heapsnapshot");

        let capture = dumper.write_snapshot(SnapshotRequest::new().path(&path).on_complete(
            move |outcome| {
                assert!(outcome.is_ok());
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(capture.path(), path);
        capture.wait().expect("capture succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_valid_snapshot(&path, 3);
    }

    #[test]
    fn unwritable_path_fails_with_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = dumper_in(dir.path(), small_heap());
        let path = dir.path().join("missing").join("x.heapsnapshot");
        let err = dumper
            .write_snapshot(SnapshotRequest::new().path(&path))
            .wait()
            .expect_err("directory does not exist");
        assert!(matches!(err, CaptureError::Io { path: ref p, .. } if *p == path), "{err:?}");
        assert_eq!(dumper.state(), CaptureState::Failed);
    }

    #[test]
    fn heap_mid_collection_fails_then_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let heap = small_heap();
        let dumper = dumper_in(dir.path(), Arc::clone(&heap));

        heap.set_collecting(true);
        let capture = dumper.write_snapshot(SnapshotRequest::new());
        let path = capture.path().to_path_buf();
        let err = capture.wait().expect_err("paused mid-collection");
        assert!(matches!(
            err,
            CaptureError::VmState(VmStateError::CollectionInProgress)
        ));
        assert!(!path.exists(), "failed capture leaves no file");
        assert_eq!(dumper.state(), CaptureState::Failed);

        heap.set_collecting(false);
        dumper
            .write_snapshot(SnapshotRequest::new())
            .wait()
            .expect("capture after collection");
        assert_eq!(dumper.state(), CaptureState::Completed);
    }

    #[test]
    fn unknown_flag_bits_are_a_config_error() {
        let err = Dumper::builder(small_heap())
            .flag_bits(Flags::NO_FORK | Flags::NO_SIGNAL | 0x8)
            .build()
            .expect_err("bit 3 is not a flag");
        assert!(matches!(err, ConfigError::UnknownFlagBits(bits) if bits.bits == 0x8));
    }

    #[test]
    fn nosignal_installs_no_trigger() {
        let dumper = Dumper::configure(small_heap(), in_process()).expect("configure");
        assert_eq!(dumper.signal(), None);
        assert_eq!(dumper.state(), CaptureState::Idle);
    }

    /// Blocks the first `pause` until released, so a capture can be held in
    /// flight.
    struct GatedHeap {
        inner: ManagedHeap,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl HeapSource for GatedHeap {
        type View<'a> = ManagedView<'a>;

        fn pause(&self) -> Result<ManagedView<'_>, VmStateError> {
            let entered = self.entered.lock().take();
            if let Some(entered) = entered {
                let _ = entered.send(());
                let _ = self.release.lock().recv();
            }
            self.inner.pause()
        }
    }

    #[test]
    fn request_during_capture_is_rejected_without_touching_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let inner = ManagedHeap::new();
        inner.mutate(|m| {
            let root = m.alloc(NodeKind::Object, "Root", 8).expect("alloc");
            m.add_root(root).expect("root");
        });
        let heap = Arc::new(GatedHeap {
            inner,
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let dumper = Dumper::builder(heap)
            .flags(in_process())
            .output_dir(dir.path())
            .build()
            .expect("configure");

        let first_path = dir.path().join("first.heapsnapshot");
        let second_path = dir.path().join("second.heapsnapshot");
        let background = dumper.clone();
        let request = SnapshotRequest::new().path(&first_path);
        let first = thread::spawn(move || background.write_snapshot(request).wait());

        entered_rx.recv().expect("first capture reached the safe point");
        assert_eq!(dumper.state(), CaptureState::Requested);

        let rejected = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&rejected);
        let err = dumper
            .write_snapshot(SnapshotRequest::new().path(&second_path).on_complete(
                move |outcome| {
                    assert!(matches!(outcome, Err(CaptureError::ConcurrentRequestRejected)));
                    seen.fetch_add(1, Ordering::SeqCst);
                },
            ))
            .wait()
            .expect_err("second capture rejected");
        assert!(matches!(err, CaptureError::ConcurrentRequestRejected));
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
        assert!(!second_path.exists());
        assert_eq!(dumper.state(), CaptureState::Requested);

        release_tx.send(()).expect("release first capture");
        let info = first
            .join()
            .expect("capture thread")
            .expect("first capture succeeds");
        assert_eq!(info.nodes, 2);
        assert_valid_snapshot(&first_path, 2);
        assert_eq!(dumper.state(), CaptureState::Completed);
    }

    #[test]
    fn signal_during_capture_is_coalesced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let inner = ManagedHeap::new();
        inner.mutate(|m| {
            let root = m.alloc(NodeKind::Object, "Root", 8).expect("alloc");
            m.add_root(root).expect("root");
        });
        let heap = Arc::new(GatedHeap {
            inner,
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
        });
        let dumper = Dumper::builder(heap)
            .flags(in_process())
            .output_dir(dir.path())
            .build()
            .expect("configure");

        let background = dumper.clone();
        let first = thread::spawn(move || background.write_snapshot(SnapshotRequest::new()).wait());
        entered_rx.recv().expect("first capture reached the safe point");

        let signalled = dumper.write_snapshot(SnapshotRequest::from_signal());
        assert!(matches!(
            signalled.wait(),
            Err(CaptureError::ConcurrentRequestRejected)
        ));
        assert_eq!(dumper.state(), CaptureState::Requested);

        release_tx.send(()).expect("release first capture");
        let info = first
            .join()
            .expect("capture thread")
            .expect("first capture succeeds");
        let files: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("dir entry").path())
            .collect();
        assert_eq!(files, vec![info.path]);
        assert_eq!(dumper.state(), CaptureState::Completed);
    }

    #[tokio::test]
    async fn finished_resolves_inside_a_runtime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dumper = dumper_in(dir.path(), small_heap());
        let info = dumper
            .write_snapshot(SnapshotRequest::new())
            .finished()
            .await
            .expect("capture succeeds");
        assert_eq!(info.edges, 2);
    }
}
