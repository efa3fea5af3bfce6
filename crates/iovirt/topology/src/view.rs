//! Typed, read-only views of topology nodes.

use core::fmt;

use iovirt_iort::NodeType;

use crate::block::{Block, NodeFlags};

/// Position of a node within its topology's arena.
///
/// Only meaningful for the topology that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeRef(pub(crate) u32);

impl NodeRef {
    /// Byte offset of the node from the start of the arena.
    #[must_use]
    pub const fn offset(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node@{:#x}", self.0)
    }
}

/// Node classes that queries index within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeClass {
    /// SMMUv1/v2 and SMMUv3 nodes together.
    Smmu,
    /// PCI root complexes.
    RootComplex,
    /// Named components.
    NamedComponent,
    /// ITS groups.
    ItsGroup,
    /// Performance monitoring counter groups.
    Pmcg,
}

impl NodeClass {
    /// Returns `true` if nodes of `kind` belong to this class.
    #[must_use]
    pub const fn contains(self, kind: NodeType) -> bool {
        matches!(
            (self, kind),
            (Self::Smmu, NodeType::SmmuV1V2 | NodeType::SmmuV3)
                | (Self::RootComplex, NodeType::RootComplex)
                | (Self::NamedComponent, NodeType::NamedComponent)
                | (Self::ItsGroup, NodeType::ItsGroup)
                | (Self::Pmcg, NodeType::Pmcg)
        )
    }
}

/// One outgoing ID mapping of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMappingEdge {
    /// Lowest input ID covered.
    pub input_base: u32,
    /// Number of IDs covered minus one.
    pub id_count: u32,
    /// Output ID corresponding to `input_base`.
    pub output_base: u32,
    /// Node the range maps onto.
    pub output: NodeRef,
}

impl IdMappingEdge {
    /// Returns `true` if `id` lies in `input_base..=input_base + id_count`.
    #[must_use]
    pub fn covers(&self, id: u32) -> bool {
        let base = u64::from(self.input_base);
        let id = u64::from(id);
        id >= base && id <= base + u64::from(self.id_count)
    }

    /// Translate `id` through this mapping, if it is covered.
    #[must_use]
    pub fn translate(&self, id: u32) -> Option<u32> {
        self.covers(id)
            .then(|| (id - self.input_base).wrapping_add(self.output_base))
    }
}

/// A node of a built topology.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'t> {
    arena: &'t [u8],
    block: Block,
}

impl<'t> NodeView<'t> {
    pub(crate) fn new(arena: &'t [u8], block: Block) -> Self {
        Self { arena, block }
    }

    pub(crate) fn block(&self) -> &Block {
        &self.block
    }

    /// Reference to this node.
    #[must_use]
    pub fn node_ref(&self) -> NodeRef {
        NodeRef(self.block.offset)
    }

    /// The node's type.
    #[must_use]
    pub fn kind(&self) -> NodeType {
        self.block.kind
    }

    /// Verdicts recorded by the post-build analysis.
    #[must_use]
    pub fn flags(&self) -> NodeFlags {
        self.block.flags()
    }

    /// Returns an iterator over the node's outgoing mappings. ITS groups have none.
    pub fn id_mappings(&self) -> impl Iterator<Item = IdMappingEdge> + use<'t> {
        let (arena, block) = (self.arena, self.block);
        let count = if block.kind == NodeType::ItsGroup {
            0
        } else {
            block.num_maps()
        };
        (0..count).filter_map(move |index| {
            let slot = block.map(arena, index)?;
            Some(IdMappingEdge {
                input_base: slot.input_base,
                id_count: slot.id_count,
                output_base: slot.output_base,
                output: NodeRef(slot.output_ref),
            })
        })
    }

    /// Returns an iterator over the ITS identifiers of an ITS group; empty
    /// for every other kind.
    pub fn its_ids(&self) -> impl Iterator<Item = u32> + use<'t> {
        self.block.its_ids(self.arena)
    }
}
