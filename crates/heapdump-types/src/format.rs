//! Heap snapshot document contract.
//!
//! Snapshots use the V8 `.heapsnapshot` JSON layout so that standard
//! heap-analysis tooling (Chrome DevTools, `heapsnapshot` parsers) can load
//! them unchanged:
//!
//! ```text
//! {"snapshot":{"meta":{..},"node_count":N,"edge_count":E,"trace_function_count":0},
//!  "nodes":[type,name,id,self_size,edge_count,trace_node_id, ...],
//!  "edges":[type,name_or_index,to_node, ...],
//!  "trace_function_infos":[],"trace_tree":[],"samples":[],"locations":[],
//!  "strings":["<dummy>", ...]}
//! ```
//!
//! Node 0 is a synthetic root with id 0 and one `element` edge per VM root.
//! Edges are grouped by source node in node order; `to_node` is the target's
//! node index times [`NODE_FIELD_COUNT`].

use facet::Facet;
use std::error::Error;
use std::fmt;

use crate::{EdgeKind, NodeKind};

pub const FILE_EXTENSION: &str = "heapsnapshot";

pub const NODE_FIELDS: [&str; 6] = [
    "type",
    "name",
    "id",
    "self_size",
    "edge_count",
    "trace_node_id",
];
pub const NODE_FIELD_COUNT: usize = NODE_FIELDS.len();

pub const EDGE_FIELDS: [&str; 3] = ["type", "name_or_index", "to_node"];
pub const EDGE_FIELD_COUNT: usize = EDGE_FIELDS.len();

/// String-table entry 0, never referenced by a node or edge.
pub const DUMMY_STRING: &str = "<dummy>";

/// Id of the synthetic root node.
pub const ROOT_NODE_ID: u64 = 0;

const TRACE_FUNCTION_INFO_FIELDS: [&str; 6] = [
    "function_id",
    "name",
    "script_name",
    "script_id",
    "line",
    "column",
];
const TRACE_NODE_FIELDS: [&str; 5] = ["id", "function_info_index", "count", "size", "children"];
const SAMPLE_FIELDS: [&str; 2] = ["timestamp_us", "last_assigned_id"];
const LOCATION_FIELDS: [&str; 4] = ["object_index", "script_id", "line", "column"];

fn quoted_list<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    let quoted: Vec<String> = items.into_iter().map(|s| format!("\"{s}\"")).collect();
    format!("[{}]", quoted.join(","))
}

/// The `snapshot.meta` object describing field layout and type tables.
pub fn meta_json() -> String {
    let node_types = quoted_list(NodeKind::ALL.iter().map(|k| k.as_str()));
    let edge_types = quoted_list(EdgeKind::ALL.iter().map(|k| k.as_str()));
    format!(
        concat!(
            "{{\"node_fields\":{},",
            "\"node_types\":[{},\"string\",\"number\",\"number\",\"number\",\"number\"],",
            "\"edge_fields\":{},",
            "\"edge_types\":[{},\"string_or_number\",\"node\"],",
            "\"trace_function_info_fields\":{},",
            "\"trace_node_fields\":{},",
            "\"sample_fields\":{},",
            "\"location_fields\":{}}}"
        ),
        quoted_list(NODE_FIELDS),
        node_types,
        quoted_list(EDGE_FIELDS),
        edge_types,
        quoted_list(TRACE_FUNCTION_INFO_FIELDS),
        quoted_list(TRACE_NODE_FIELDS),
        quoted_list(SAMPLE_FIELDS),
        quoted_list(LOCATION_FIELDS),
    )
}

// ── Reading a document back ──────────────────────────────────

#[derive(Facet, Debug)]
pub struct SnapshotHeader {
    pub meta: facet_value::Value,
    pub node_count: u64,
    pub edge_count: u64,
    pub trace_function_count: u64,
}

/// Typed shape of a snapshot document, used to check what a capture wrote.
#[derive(Facet, Debug)]
pub struct SnapshotDocument {
    pub snapshot: SnapshotHeader,
    pub nodes: Vec<u64>,
    pub edges: Vec<u64>,
    pub trace_function_infos: Vec<u64>,
    pub trace_tree: Vec<u64>,
    pub samples: Vec<u64>,
    pub locations: Vec<u64>,
    pub strings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    Parse(String),
    Shape(String),
}

impl fmt::Display for DocumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(detail) => write!(f, "snapshot is not valid JSON: {detail}"),
            Self::Shape(detail) => write!(f, "snapshot layout is inconsistent: {detail}"),
        }
    }
}

impl Error for DocumentError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord<'a> {
    pub index: usize,
    pub kind: NodeKind,
    pub name: &'a str,
    pub id: u64,
    pub self_size: u64,
    pub edge_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLabel<'a> {
    Name(&'a str),
    Index(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeRecord<'a> {
    pub kind: EdgeKind,
    pub label: EdgeLabel<'a>,
    /// Node index (not field offset) of the target.
    pub to: usize,
}

fn field(values: &[u64], at: usize) -> Result<u64, DocumentError> {
    values
        .get(at)
        .copied()
        .ok_or_else(|| DocumentError::Shape(format!("array too short at offset {at}")))
}

fn as_usize(value: u64, what: &str) -> Result<usize, DocumentError> {
    usize::try_from(value).map_err(|_| DocumentError::Shape(format!("{what} {value} overflows")))
}

impl SnapshotDocument {
    /// Parses and checks the layout: array lengths, edge grouping, type
    /// indices, string and node references.
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let doc: SnapshotDocument =
            facet_json::from_str(text).map_err(|e| DocumentError::Parse(e.to_string()))?;
        doc.check()?;
        Ok(doc)
    }

    fn check(&self) -> Result<(), DocumentError> {
        let node_count = as_usize(self.snapshot.node_count, "node_count")?;
        let edge_count = as_usize(self.snapshot.edge_count, "edge_count")?;
        if self.nodes.len() != node_count * NODE_FIELD_COUNT {
            return Err(DocumentError::Shape(format!(
                "{} node fields for node_count {node_count}",
                self.nodes.len()
            )));
        }
        if self.edges.len() != edge_count * EDGE_FIELD_COUNT {
            return Err(DocumentError::Shape(format!(
                "{} edge fields for edge_count {edge_count}",
                self.edges.len()
            )));
        }
        if self.strings.first().map(String::as_str) != Some(DUMMY_STRING) {
            return Err(DocumentError::Shape("string table must start with <dummy>".into()));
        }
        let mut grouped = 0usize;
        for node in self.nodes()? {
            self.edges_at(grouped, &node)?;
            grouped += node.edge_count;
        }
        if grouped != edge_count {
            return Err(DocumentError::Shape(format!(
                "nodes claim {grouped} edges, header says {edge_count}"
            )));
        }
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len() / NODE_FIELD_COUNT
    }

    fn string(&self, index: u64) -> Result<&str, DocumentError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.strings.get(i))
            .map(String::as_str)
            .ok_or_else(|| DocumentError::Shape(format!("string index {index} out of range")))
    }

    pub fn node(&self, index: usize) -> Result<NodeRecord<'_>, DocumentError> {
        let base = index * NODE_FIELD_COUNT;
        let kind_index = field(&self.nodes, base)?;
        let kind = NodeKind::from_index(kind_index)
            .ok_or_else(|| DocumentError::Shape(format!("unknown node type {kind_index}")))?;
        Ok(NodeRecord {
            index,
            kind,
            name: self.string(field(&self.nodes, base + 1)?)?,
            id: field(&self.nodes, base + 2)?,
            self_size: field(&self.nodes, base + 3)?,
            edge_count: as_usize(field(&self.nodes, base + 4)?, "edge_count")?,
        })
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord<'_>>, DocumentError> {
        (0..self.node_count()).map(|i| self.node(i)).collect()
    }

    /// Edges owned by `node`, found by summing the edge counts of the nodes
    /// before it.
    pub fn edges_of(&self, node: &NodeRecord<'_>) -> Result<Vec<EdgeRecord<'_>>, DocumentError> {
        let mut first = 0usize;
        for i in 0..node.index {
            first += as_usize(field(&self.nodes, i * NODE_FIELD_COUNT + 4)?, "edge_count")?;
        }
        self.edges_at(first, node)
    }

    /// Edges of `node`, whose group starts at edge `first`.
    fn edges_at(
        &self,
        first: usize,
        node: &NodeRecord<'_>,
    ) -> Result<Vec<EdgeRecord<'_>>, DocumentError> {
        (first..first + node.edge_count)
            .map(|e| {
                let base = e * EDGE_FIELD_COUNT;
                let kind_index = field(&self.edges, base)?;
                let kind = EdgeKind::from_index(kind_index).ok_or_else(|| {
                    DocumentError::Shape(format!("unknown edge type {kind_index}"))
                })?;
                let raw_label = field(&self.edges, base + 1)?;
                let label = if kind.is_indexed() {
                    EdgeLabel::Index(raw_label)
                } else {
                    EdgeLabel::Name(self.string(raw_label)?)
                };
                let to_field = as_usize(field(&self.edges, base + 2)?, "to_node")?;
                if to_field % NODE_FIELD_COUNT != 0 || to_field >= self.nodes.len() {
                    return Err(DocumentError::Shape(format!("bad to_node offset {to_field}")));
                }
                Ok(EdgeRecord {
                    kind,
                    label,
                    to: to_field / NODE_FIELD_COUNT,
                })
            })
            .collect()
    }
}
