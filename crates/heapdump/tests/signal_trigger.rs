//! A configured signal triggers a capture to an auto-generated path.
//!
//! Lives in its own test binary: the handler is process-wide.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use heapdump::format::SnapshotDocument;
use heapdump::{CaptureState, ConfigError, Dumper, Flags, ManagedHeap, NodeKind, handler_installed};

fn snapshots_in(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
        .expect("read output dir")
        .map(|entry| entry.expect("dir entry").path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "heapsnapshot"))
        .collect();
    found.sort();
    found
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn signal_writes_a_snapshot_to_the_output_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let heap = ManagedHeap::new();
    heap.mutate(|m| {
        let root = m.alloc(NodeKind::Object, "Root", 32).expect("alloc");
        let child = m.alloc(NodeKind::Array, "Array", 16).expect("alloc");
        m.add_root(root).expect("root");
        m.push_element(root, child).expect("push");
    });

    let dumper = Dumper::builder(Arc::new(heap))
        .flags(Flags::default())
        .signal(libc::SIGUSR1)
        .output_dir(dir.path())
        .build()
        .expect("configure with signal trigger");
    assert_eq!(dumper.signal(), Some(libc::SIGUSR1));
    assert!(handler_installed(libc::SIGUSR1));

    let second = Dumper::configure(Arc::new(ManagedHeap::new()), Flags::default());
    assert!(matches!(
        second,
        Err(ConfigError::SignalAlreadyInstalled { .. })
    ));

    unsafe {
        libc::kill(libc::getpid(), libc::SIGUSR1);
    }

    assert!(
        wait_until(Duration::from_secs(10), || {
            dumper.state() == CaptureState::Completed && !snapshots_in(dir.path()).is_empty()
        }),
        "no snapshot after signal, state {:?}",
        dumper.state()
    );

    let written = snapshots_in(dir.path());
    let name = written[0]
        .file_name()
        .and_then(|n| n.to_str())
        .expect("utf-8 name");
    assert!(name.starts_with("heapdump-"), "{name}");
    let text = std::fs::read_to_string(&written[0]).expect("read snapshot");
    let doc = SnapshotDocument::parse(&text).expect("valid snapshot");
    assert_eq!(doc.node_count(), 3);
}
