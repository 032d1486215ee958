//! A small managed heap used as the reference host VM.
//!
//! Mutation happens inside [`ManagedHeap::mutate`], which holds the write side
//! of a `parking_lot::RwLock`; [`HeapSource::pause`] takes the read side, so a
//! paused view is a stop-the-world safe point.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::error::Error;
use std::fmt;

use heapdump_types::{EdgeKind, InvariantError, NodeKind, ObjectId};
use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::VmStateError;
use crate::graph::{HeapSource, HeapView, ObjectInfo, RefName, Reference};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory { requested: u64, used: u64, limit: u64 },
    UnknownObject(ObjectId),
    Invariant(InvariantError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                used,
                limit,
            } => write!(
                f,
                "out of memory: {requested} bytes requested with {used}/{limit} in use"
            ),
            Self::UnknownObject(id) => write!(f, "no live object {id}"),
            Self::Invariant(inner) => write!(f, "invariant violated: {inner}"),
        }
    }
}

impl Error for HeapError {}

impl From<InvariantError> for HeapError {
    fn from(value: InvariantError) -> Self {
        Self::Invariant(value)
    }
}

#[derive(Debug, Clone)]
enum SlotName {
    Named(String),
    Index(u32),
}

#[derive(Debug, Clone)]
struct Slot {
    kind: EdgeKind,
    name: SlotName,
    target: ObjectId,
}

#[derive(Debug, Clone)]
struct HeapObject {
    kind: NodeKind,
    name: String,
    size: u64,
    slots: Vec<Slot>,
}

#[derive(Debug, Default)]
struct HeapState {
    objects: HashMap<ObjectId, HeapObject>,
    roots: Vec<ObjectId>,
    last_id: u64,
    used_bytes: u64,
    collecting: bool,
}

impl HeapState {
    fn mark(&self) -> BTreeSet<ObjectId> {
        let mut marked = BTreeSet::new();
        let mut queue: VecDeque<ObjectId> = self.roots.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            let Some(object) = self.objects.get(&id) else {
                continue;
            };
            if !marked.insert(id) {
                continue;
            }
            queue.extend(
                object
                    .slots
                    .iter()
                    .filter(|slot| slot.kind.is_strong())
                    .map(|slot| slot.target),
            );
        }
        marked
    }
}

pub struct ManagedHeap {
    state: RwLock<HeapState>,
    limit: Option<u64>,
}

impl Default for ManagedHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HeapState::default()),
            limit: None,
        }
    }

    /// A heap whose allocations fail once `limit` bytes are in use.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            state: RwLock::new(HeapState::default()),
            limit: Some(limit),
        }
    }

    /// Runs `f` with exclusive mutation rights. Captures wait for it to return.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Mutator<'_>) -> R) -> R {
        let mut state = self.state.write();
        let mut mutator = Mutator {
            state: &mut state,
            limit: self.limit,
        };
        f(&mut mutator)
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.read().used_bytes
    }

    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Objects kept alive by strong references from the roots.
    pub fn reachable(&self) -> BTreeSet<ObjectId> {
        self.state.read().mark()
    }

    /// Marks the heap as mid-collection; pausing fails until cleared.
    pub fn set_collecting(&self, collecting: bool) {
        self.state.write().collecting = collecting;
    }
}

pub struct Mutator<'a> {
    state: &'a mut HeapState,
    limit: Option<u64>,
}

impl Mutator<'_> {
    pub fn alloc(
        &mut self,
        kind: NodeKind,
        name: impl Into<String>,
        size: u64,
    ) -> Result<ObjectId, HeapError> {
        let used = self.state.used_bytes;
        if let Some(limit) = self.limit
            && used.saturating_add(size) > limit
        {
            return Err(HeapError::OutOfMemory {
                requested: size,
                used,
                limit,
            });
        }
        let id = ObjectId::new(self.state.last_id + 1)?;
        self.state.last_id = id.get();
        self.state.used_bytes = used + size;
        self.state.objects.insert(
            id,
            HeapObject {
                kind,
                name: name.into(),
                size,
                slots: Vec::new(),
            },
        );
        Ok(id)
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut HeapObject, HeapError> {
        self.state
            .objects
            .get_mut(&id)
            .ok_or(HeapError::UnknownObject(id))
    }

    fn check_live(&self, id: ObjectId) -> Result<(), HeapError> {
        if self.state.objects.contains_key(&id) {
            Ok(())
        } else {
            Err(HeapError::UnknownObject(id))
        }
    }

    fn set_named(
        &mut self,
        owner: ObjectId,
        kind: EdgeKind,
        name: &str,
        target: ObjectId,
    ) -> Result<(), HeapError> {
        self.check_live(target)?;
        let object = self.object_mut(owner)?;
        let existing = object.slots.iter_mut().find(|slot| {
            slot.kind == kind && matches!(&slot.name, SlotName::Named(n) if n == name)
        });
        match existing {
            Some(slot) => slot.target = target,
            None => object.slots.push(Slot {
                kind,
                name: SlotName::Named(name.to_string()),
                target,
            }),
        }
        Ok(())
    }

    /// Sets (or replaces) a named property.
    pub fn set_property(
        &mut self,
        owner: ObjectId,
        name: &str,
        target: ObjectId,
    ) -> Result<(), HeapError> {
        self.set_named(owner, EdgeKind::Property, name, target)
    }

    pub fn set_internal(
        &mut self,
        owner: ObjectId,
        name: &str,
        target: ObjectId,
    ) -> Result<(), HeapError> {
        self.set_named(owner, EdgeKind::Internal, name, target)
    }

    /// A reference that does not keep `target` alive.
    pub fn set_weak(
        &mut self,
        owner: ObjectId,
        name: &str,
        target: ObjectId,
    ) -> Result<(), HeapError> {
        self.set_named(owner, EdgeKind::Weak, name, target)
    }

    /// Appends an indexed element and returns its index.
    pub fn push_element(&mut self, owner: ObjectId, target: ObjectId) -> Result<u32, HeapError> {
        self.check_live(target)?;
        let object = self.object_mut(owner)?;
        let index = object
            .slots
            .iter()
            .filter(|slot| slot.kind == EdgeKind::Element)
            .count() as u32;
        object.slots.push(Slot {
            kind: EdgeKind::Element,
            name: SlotName::Index(index),
            target,
        });
        Ok(index)
    }

    /// Drops every slot of `owner` that points at `target`.
    pub fn clear_references_to(
        &mut self,
        owner: ObjectId,
        target: ObjectId,
    ) -> Result<usize, HeapError> {
        let object = self.object_mut(owner)?;
        let before = object.slots.len();
        object.slots.retain(|slot| slot.target != target);
        Ok(before - object.slots.len())
    }

    pub fn add_root(&mut self, id: ObjectId) -> Result<(), HeapError> {
        self.check_live(id)?;
        if !self.state.roots.contains(&id) {
            self.state.roots.push(id);
        }
        Ok(())
    }

    pub fn remove_root(&mut self, id: ObjectId) -> bool {
        let before = self.state.roots.len();
        self.state.roots.retain(|root| *root != id);
        before != self.state.roots.len()
    }

    /// Mark-sweep over strong references. Weak slots to swept objects are
    /// cleared. Returns the number of objects freed.
    pub fn collect(&mut self) -> usize {
        let marked = self.state.mark();
        let before = self.state.objects.len();
        let mut freed_bytes = 0;
        self.state.objects.retain(|id, object| {
            let keep = marked.contains(id);
            if !keep {
                freed_bytes += object.size;
            }
            keep
        });
        for object in self.state.objects.values_mut() {
            object.slots.retain(|slot| marked.contains(&slot.target));
        }
        self.state.used_bytes -= freed_bytes;
        before - self.state.objects.len()
    }
}

/// Stop-the-world view over a [`ManagedHeap`].
pub struct ManagedView<'a> {
    state: RwLockReadGuard<'a, HeapState>,
}

impl HeapSource for ManagedHeap {
    type View<'a> = ManagedView<'a>;

    fn pause(&self) -> Result<ManagedView<'_>, VmStateError> {
        let state = self.state.read();
        if state.collecting {
            return Err(VmStateError::CollectionInProgress);
        }
        Ok(ManagedView { state })
    }
}

impl HeapView for ManagedView<'_> {
    fn for_each_root(&self, visit: &mut dyn FnMut(ObjectId)) {
        for root in &self.state.roots {
            visit(*root);
        }
    }

    fn object(&self, id: ObjectId) -> Option<ObjectInfo<'_>> {
        self.state.objects.get(&id).map(|object| ObjectInfo {
            kind: object.kind,
            name: &object.name,
            self_size: object.size,
        })
    }

    fn for_each_reference(&self, id: ObjectId, visit: &mut dyn FnMut(Reference<'_>)) {
        let Some(object) = self.state.objects.get(&id) else {
            return;
        };
        for slot in &object.slots {
            let name = match &slot.name {
                SlotName::Named(name) => RefName::Named(name),
                SlotName::Index(index) => RefName::Index(*index),
            };
            visit(Reference {
                kind: slot.kind,
                name,
                target: slot.target,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_past_limit_fails_without_side_effects() {
        let heap = ManagedHeap::with_limit(100);
        heap.mutate(|m| {
            m.alloc(NodeKind::Object, "A", 60).expect("fits");
            let err = m.alloc(NodeKind::Object, "B", 60).expect_err("over limit");
            assert!(matches!(
                err,
                HeapError::OutOfMemory {
                    requested: 60,
                    used: 60,
                    limit: 100
                }
            ));
        });
        assert_eq!(heap.used_bytes(), 60);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn collect_frees_unreachable_and_clears_weak_slots() {
        let heap = ManagedHeap::new();
        let (root, kept, dropped) = heap.mutate(|m| {
            let root = m.alloc(NodeKind::Object, "Root", 10).expect("alloc");
            let kept = m.alloc(NodeKind::Object, "Kept", 20).expect("alloc");
            let dropped = m.alloc(NodeKind::Object, "Dropped", 30).expect("alloc");
            m.add_root(root).expect("root");
            m.set_property(root, "kept", kept).expect("property");
            m.set_weak(root, "cache", dropped).expect("weak");
            (root, kept, dropped)
        });

        assert_eq!(heap.reachable(), BTreeSet::from([root, kept]));
        let freed = heap.mutate(|m| m.collect());
        assert_eq!(freed, 1);
        assert_eq!(heap.used_bytes(), 30);

        let view = heap.pause().expect("pause");
        assert!(view.object(dropped).is_none());
        let mut targets = Vec::new();
        view.for_each_reference(root, &mut |r| targets.push(r.target));
        assert_eq!(targets, vec![kept]);
    }

    #[test]
    fn set_property_replaces_existing_slot() {
        let heap = ManagedHeap::new();
        let (owner, second) = heap.mutate(|m| {
            let owner = m.alloc(NodeKind::Object, "Owner", 1).expect("alloc");
            let first = m.alloc(NodeKind::String, "first", 1).expect("alloc");
            let second = m.alloc(NodeKind::String, "second", 1).expect("alloc");
            m.set_property(owner, "value", first).expect("set");
            m.set_property(owner, "value", second).expect("replace");
            (owner, second)
        });
        let view = heap.pause().expect("pause");
        let mut refs = Vec::new();
        view.for_each_reference(owner, &mut |r| {
            let name = match r.name {
                RefName::Named(name) => name.to_string(),
                RefName::Index(index) => index.to_string(),
            };
            refs.push((r.kind, name, r.target));
        });
        assert_eq!(refs, vec![(EdgeKind::Property, "value".to_string(), second)]);
    }

    #[test]
    fn elements_are_indexed_in_push_order() {
        let heap = ManagedHeap::new();
        heap.mutate(|m| {
            let array = m.alloc(NodeKind::Array, "Array", 8).expect("alloc");
            let a = m.alloc(NodeKind::Number, "1", 8).expect("alloc");
            let b = m.alloc(NodeKind::Number, "2", 8).expect("alloc");
            assert_eq!(m.push_element(array, a).expect("push"), 0);
            assert_eq!(m.push_element(array, b).expect("push"), 1);
        });
    }

    #[test]
    fn references_to_dead_objects_are_refused() {
        let heap = ManagedHeap::new();
        heap.mutate(|m| {
            let owner = m.alloc(NodeKind::Object, "Owner", 1).expect("alloc");
            let ghost = ObjectId::new(999).expect("non-zero");
            assert_eq!(
                m.set_property(owner, "x", ghost),
                Err(HeapError::UnknownObject(ghost))
            );
            assert_eq!(m.add_root(ghost), Err(HeapError::UnknownObject(ghost)));
        });
    }

    #[test]
    fn pause_fails_mid_collection() {
        let heap = ManagedHeap::new();
        heap.set_collecting(true);
        assert!(matches!(heap.pause(), Err(VmStateError::CollectionInProgress)));
        heap.set_collecting(false);
        assert!(heap.pause().is_ok());
    }
}
