//! Build and query errors.

use core::fmt;

use iovirt_iort::{AcpiError, NodeType};

/// Fatal conditions that abort a topology build.
///
/// Any of these means the firmware table (or the arena handed to the
/// builder) is unusable; no partial graph is exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    /// The table header, a node or a mapping array is malformed or out of bounds.
    Table(AcpiError),
    /// A node carries a type tag the builder does not model.
    UnknownNodeType {
        /// Table offset of the node.
        offset: u32,
        /// The raw type byte.
        node_type: u8,
    },
    /// A mapping reference re-enters a node that is still being resolved.
    ReferenceCycle {
        /// Table offset of the node referenced a second time.
        offset: u32,
    },
    /// Reference chains nest deeper than the builder tracks.
    NestingTooDeep {
        /// Table offset of the node that could not be entered.
        offset: u32,
    },
    /// The SMMU override names an architecture revision other than 2 or 3.
    UnsupportedSmmuRevision {
        /// The configured revision.
        revision: u32,
    },
    /// The arena cannot hold the next block.
    ArenaExhausted {
        /// Bytes the arena would need to hold the graph so far.
        needed: usize,
        /// Bytes available.
        capacity: usize,
    },
    /// The arena is too small to hold even its header.
    ArenaTooSmall,
}

impl From<AcpiError> for BuildError {
    fn from(err: AcpiError) -> Self {
        Self::Table(err)
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Table(err) => write!(f, "malformed IORT: {err}"),
            Self::UnknownNodeType { offset, node_type } => {
                write!(f, "unknown IORT node type {node_type} at offset {offset:#x}")
            }
            Self::ReferenceCycle { offset } => {
                write!(f, "IORT node at offset {offset:#x} references itself")
            }
            Self::NestingTooDeep { offset } => {
                write!(f, "IORT references nest too deeply at offset {offset:#x}")
            }
            Self::UnsupportedSmmuRevision { revision } => {
                write!(f, "SMMU override revision {revision} is neither 2 nor 3")
            }
            Self::ArenaExhausted { needed, capacity } => write!(
                f,
                "topology needs {needed} bytes but the arena holds {capacity}"
            ),
            Self::ArenaTooSmall => write!(f, "arena too small for its header"),
        }
    }
}

impl core::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Table(err) => Some(err),
            _ => None,
        }
    }
}

/// Per-query failures. None of these invalidate the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    /// The index is past the number of nodes of the queried class.
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of nodes of that class.
        count: usize,
    },
    /// No ID mapping covers the requested identifier.
    NoMapping,
    /// A mapping leads to a node that cannot appear at that step of a translation.
    UnsupportedHop {
        /// Kind of the node the mapping landed on.
        kind: NodeType,
    },
    /// The root complex does not sit behind any SMMU.
    NotBehindIommu,
    /// A stored reference does not resolve to a block of the graph.
    InvalidReference {
        /// The offending graph offset.
        offset: u32,
    },
    /// No node matches the requested key.
    NotFound,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index, count } => {
                write!(f, "index {index} out of range ({count} nodes)")
            }
            Self::NoMapping => write!(f, "no ID mapping covers the identifier"),
            Self::UnsupportedHop { kind } => write!(f, "mapping leads to unsupported {kind} node"),
            Self::NotBehindIommu => write!(f, "root complex is not behind an SMMU"),
            Self::InvalidReference { offset } => {
                write!(f, "graph offset {offset:#x} is not a node")
            }
            Self::NotFound => write!(f, "no matching node"),
        }
    }
}

impl core::error::Error for QueryError {}
