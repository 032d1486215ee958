//! Heap walker: reachability planning plus streaming serialization.
//!
//! The walk makes one breadth-first pass over strong references to fix node
//! order, then re-reads the paused view while writing nodes, edges and the
//! string table straight to a buffered file. Only object ids and interned
//! strings are held in memory; the graph itself is never copied.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use heapdump_types::format::{DUMMY_STRING, NODE_FIELD_COUNT, ROOT_NODE_ID, meta_json};
use heapdump_types::{EdgeKind, NodeKind, ObjectId};

use crate::error::{CaptureError, VmStateError};
use crate::graph::{HeapView, RefName, Reference};
use crate::state::CaptureState;

/// Output buffer size; big chunks keep syscall count low on large heaps.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    /// Nodes written, including the synthetic root.
    pub nodes: u64,
    pub edges: u64,
    pub bytes: u64,
}

/// Node order and edge count of one walk.
#[derive(Debug)]
pub struct WalkPlan {
    roots: Vec<ObjectId>,
    /// Reachable objects in node order; node index is position + 1.
    order: Vec<ObjectId>,
    index: HashMap<ObjectId, usize>,
    edge_count: u64,
}

impl WalkPlan {
    pub fn build<V: HeapView + ?Sized>(view: &V) -> Result<Self, VmStateError> {
        let mut roots = Vec::new();
        let mut seen = HashSet::new();
        view.for_each_root(&mut |root| {
            if seen.insert(root) {
                roots.push(root);
            }
        });

        let mut order: Vec<ObjectId> = Vec::with_capacity(roots.len());
        let mut index = HashMap::with_capacity(roots.len());
        for root in &roots {
            if view.object(*root).is_none() {
                return Err(VmStateError::DanglingRoot { root: *root });
            }
            if !index.contains_key(root) {
                index.insert(*root, order.len() + 1);
                order.push(*root);
            }
        }

        // `order` doubles as the BFS queue.
        let mut cursor = 0;
        let mut failure = None;
        while cursor < order.len() {
            let from = order[cursor];
            cursor += 1;
            view.for_each_reference(from, &mut |reference| {
                if failure.is_some() {
                    return;
                }
                if !reference.is_well_formed() {
                    failure = Some(VmStateError::MalformedReference {
                        from,
                        detail: format!("{} edge with label {:?}", reference.kind.as_str(), reference.name),
                    });
                    return;
                }
                if !reference.kind.is_strong() || index.contains_key(&reference.target) {
                    return;
                }
                if view.object(reference.target).is_none() {
                    failure = Some(VmStateError::DanglingReference {
                        from,
                        to: reference.target,
                    });
                    return;
                }
                index.insert(reference.target, order.len() + 1);
                order.push(reference.target);
            });
            if let Some(err) = failure.take() {
                return Err(err);
            }
        }

        let mut plan = Self {
            edge_count: roots.len() as u64,
            roots,
            order,
            index,
        };
        let mut emitted = 0u64;
        for id in &plan.order {
            view.for_each_reference(*id, &mut |reference| {
                if plan.emits(&reference) {
                    emitted += 1;
                }
            });
        }
        plan.edge_count += emitted;
        Ok(plan)
    }

    /// Weak edges appear only when their target is strongly reachable.
    fn emits(&self, reference: &Reference<'_>) -> bool {
        reference.kind.is_strong() || self.index.contains_key(&reference.target)
    }

    pub fn node_count(&self) -> u64 {
        self.order.len() as u64 + 1
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count
    }

    /// Reachable objects in node order, roots first.
    pub fn objects(&self) -> &[ObjectId] {
        &self.order
    }

    fn to_node(&self, target: ObjectId) -> Option<usize> {
        self.index.get(&target).map(|i| i * NODE_FIELD_COUNT)
    }
}

struct StringTable {
    ids: HashMap<String, u64>,
    strings: Vec<String>,
}

impl StringTable {
    fn new() -> Self {
        let mut table = Self {
            ids: HashMap::new(),
            strings: Vec::new(),
        };
        table.intern(DUMMY_STRING);
        table
    }

    fn intern(&mut self, value: &str) -> u64 {
        if let Some(id) = self.ids.get(value) {
            return *id;
        }
        let id = self.strings.len() as u64;
        self.ids.insert(value.to_string(), id);
        self.strings.push(value.to_string());
        id
    }
}

struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
enum WriteFailure {
    Io(io::Error),
    Vm(VmStateError),
}

impl From<io::Error> for WriteFailure {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<VmStateError> for WriteFailure {
    fn from(value: VmStateError) -> Self {
        Self::Vm(value)
    }
}

fn vanished(id: ObjectId) -> VmStateError {
    VmStateError::Unavailable(format!("{id} changed while the heap was paused"))
}

/// Streams the document for `plan` into `out`.
pub(crate) fn serialize<V, W>(view: &V, plan: &WalkPlan, out: W) -> Result<WalkStats, WriteError>
where
    V: HeapView + ?Sized,
    W: Write,
{
    let mut out = CountingWriter {
        inner: BufWriter::with_capacity(CHUNK_SIZE, out),
        written: 0,
    };
    let mut strings = StringTable::new();
    write_body(view, plan, &mut out, &mut strings).map_err(WriteError)?;
    out.flush().map_err(|e| WriteError(WriteFailure::Io(e)))?;
    Ok(WalkStats {
        nodes: plan.node_count(),
        edges: plan.edge_count(),
        bytes: out.written,
    })
}

/// Failure while streaming a document.
#[derive(Debug)]
pub(crate) struct WriteError(WriteFailure);

impl WriteError {
    fn into_capture_error(self, path: &Path) -> CaptureError {
        match self.0 {
            WriteFailure::Io(e) => CaptureError::io(path, e),
            WriteFailure::Vm(e) => CaptureError::VmState(e),
        }
    }
}

fn write_body<V, W>(
    view: &V,
    plan: &WalkPlan,
    out: &mut W,
    strings: &mut StringTable,
) -> Result<(), WriteFailure>
where
    V: HeapView + ?Sized,
    W: Write,
{
    write!(
        out,
        "{{\"snapshot\":{{\"meta\":{},\"node_count\":{},\"edge_count\":{},\"trace_function_count\":0}},\n\"nodes\":[",
        meta_json(),
        plan.node_count(),
        plan.edge_count(),
    )?;

    let root_name = strings.intern("");
    writeln!(
        out,
        "{},{},{},0,{},0",
        NodeKind::Synthetic.index(),
        root_name,
        ROOT_NODE_ID,
        plan.roots.len()
    )?;
    for id in &plan.order {
        let info = view.object(*id).ok_or_else(|| vanished(*id))?;
        let mut edge_count = 0u64;
        view.for_each_reference(*id, &mut |reference| {
            if plan.emits(&reference) {
                edge_count += 1;
            }
        });
        let name = strings.intern(info.name);
        writeln!(
            out,
            ",{},{},{},{},{},0",
            info.kind.index(),
            name,
            id.get(),
            info.self_size,
            edge_count
        )?;
    }

    out.write_all(b"],\n\"edges\":[")?;
    let mut first = true;
    for (i, root) in plan.roots.iter().enumerate() {
        let to = plan.to_node(*root).ok_or_else(|| vanished(*root))?;
        let sep = if first { "" } else { "," };
        first = false;
        writeln!(out, "{sep}{},{i},{to}", EdgeKind::Element.index())?;
    }
    for id in &plan.order {
        let mut failure: Option<WriteFailure> = None;
        view.for_each_reference(*id, &mut |reference| {
            if failure.is_some() || !plan.emits(&reference) {
                return;
            }
            let Some(to) = plan.to_node(reference.target) else {
                failure = Some(WriteFailure::Vm(vanished(reference.target)));
                return;
            };
            let label = match reference.name {
                RefName::Index(index) => u64::from(index),
                RefName::Named(name) => strings.intern(name),
            };
            let sep = if first { "" } else { "," };
            first = false;
            if let Err(e) = writeln!(out, "{sep}{},{label},{to}", reference.kind.index()) {
                failure = Some(WriteFailure::Io(e));
            }
        });
        if let Some(failure) = failure {
            return Err(failure);
        }
    }

    out.write_all(
        b"],\n\"trace_function_infos\":[],\n\"trace_tree\":[],\n\"samples\":[],\n\"locations\":[],\n\"strings\":[",
    )?;
    for (i, value) in strings.strings.iter().enumerate() {
        let encoded = facet_json::to_string(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("encode string: {e}")))?;
        if i > 0 {
            out.write_all(b",\n")?;
        }
        out.write_all(encoded.as_bytes())?;
    }
    out.write_all(b"]}\n")?;
    Ok(())
}

/// Creates the destination file. Done before the heap is paused so an
/// unwritable path fails without stopping the mutator.
pub(crate) fn create_destination(path: &Path) -> Result<File, CaptureError> {
    File::create(path).map_err(|e| CaptureError::io(path, e))
}

/// Walks `view` into an already created destination. A partial file is
/// removed on failure. `phase` is told when the walk moves to
/// [`CaptureState::Walking`] and [`CaptureState::Writing`].
pub(crate) fn write_to_destination<V: HeapView + ?Sized>(
    view: &V,
    file: File,
    path: &Path,
    phase: &mut dyn FnMut(CaptureState),
) -> Result<WalkStats, CaptureError> {
    phase(CaptureState::Walking);
    let result = WalkPlan::build(view)
        .map_err(CaptureError::from)
        .and_then(|plan| {
            phase(CaptureState::Writing);
            serialize(view, &plan, file).map_err(|e| e.into_capture_error(path))
        });
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

/// Walks `view` and writes a complete snapshot to `path`.
pub fn write_snapshot_file<V: HeapView + ?Sized>(
    view: &V,
    path: &Path,
    phase: &mut dyn FnMut(CaptureState),
) -> Result<WalkStats, CaptureError> {
    let file = create_destination(path)?;
    write_to_destination(view, file, path, phase)
}
