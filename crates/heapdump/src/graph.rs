//! The host VM seen from the walker: a pausable, read-only object graph.

use heapdump_types::{EdgeKind, NodeKind, ObjectId};

use crate::error::VmStateError;

/// A managed heap that can be brought to a safe point.
///
/// `pause` must block until the VM's mutator is stopped and return a view
/// that stays consistent until dropped. Dropping the view resumes mutation.
/// The view may be carried across `fork` into a child process, so it must
/// not depend on other threads to make progress while it is read.
pub trait HeapSource: Send + Sync + 'static {
    type View<'a>: HeapView
    where
        Self: 'a;

    fn pause(&self) -> Result<Self::View<'_>, VmStateError>;
}

/// Read-only access to a paused heap.
pub trait HeapView {
    /// Visits each root once, in a stable order.
    fn for_each_root(&self, visit: &mut dyn FnMut(ObjectId));

    /// Metadata of a live object, `None` if the id names nothing.
    fn object(&self, id: ObjectId) -> Option<ObjectInfo<'_>>;

    /// Visits each outgoing reference of `id` in slot order.
    fn for_each_reference(&self, id: ObjectId, visit: &mut dyn FnMut(Reference<'_>));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo<'a> {
    pub kind: NodeKind,
    /// Class label for objects, contents for strings.
    pub name: &'a str,
    pub self_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefName<'a> {
    Named(&'a str),
    Index(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference<'a> {
    pub kind: EdgeKind,
    pub name: RefName<'a>,
    pub target: ObjectId,
}

impl<'a> Reference<'a> {
    pub fn property(name: &'a str, target: ObjectId) -> Self {
        Self {
            kind: EdgeKind::Property,
            name: RefName::Named(name),
            target,
        }
    }

    pub fn element(index: u32, target: ObjectId) -> Self {
        Self {
            kind: EdgeKind::Element,
            name: RefName::Index(index),
            target,
        }
    }

    pub fn internal(name: &'a str, target: ObjectId) -> Self {
        Self {
            kind: EdgeKind::Internal,
            name: RefName::Named(name),
            target,
        }
    }

    pub fn weak(name: &'a str, target: ObjectId) -> Self {
        Self {
            kind: EdgeKind::Weak,
            name: RefName::Named(name),
            target,
        }
    }

    /// Whether the name form matches what the edge kind carries in a snapshot.
    pub fn is_well_formed(&self) -> bool {
        matches!(
            (self.kind.is_indexed(), self.name),
            (true, RefName::Index(_)) | (false, RefName::Named(_))
        )
    }
}
