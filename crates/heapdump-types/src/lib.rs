//! Shared vocabulary for heapdump.
//!
//! - [`Flags`]: the two capture behaviour bits and the option-token parser.
//! - [`ObjectId`]: stable, non-zero identity of a heap object.
//! - [`NodeKind`] / [`EdgeKind`]: the node and edge type tables of the
//!   heap snapshot format.
//! - [`format`]: the on-disk snapshot document contract.

mod flags;
pub mod format;
mod ids;
mod kinds;

pub use flags::{Flags, ParsedOptions, UnknownFlagBits};
pub use ids::{InvariantError, ObjectId};
pub use kinds::{EdgeKind, NodeKind};
