//! Arena layout of the topology graph.
//!
//! The graph lives in a caller-owned byte buffer and every cross-node
//! reference is a byte offset from the start of that buffer, so the graph
//! can be placed anywhere and inspected without native pointers:
//!
//! ```text
//! +-------------+---------------------------------------------+
//! | ArenaHeader | block | block | ...                         |
//! +-------------+---------------------------------------------+
//!  block = BlockHeader | payload (data_len bytes) | num_maps * MapSlot
//! ```
//!
//! ITS groups have no outgoing edges; their identifiers are packed four to a
//! map slot instead. Offset 0 holds the arena header, so a zero reference
//! never names a block.

use bitflags::bitflags;
use iovirt_binparse::{FromBytes, packed_records};
use iovirt_iort::NodeType;

/// Maximum stored length of a named component's namespace path, NUL included.
pub const MAX_NAMED_COMPONENT_NAME: usize = 150;

/// Number of ITS identifiers packed into one map slot.
pub(crate) const ITS_IDS_PER_SLOT: u32 = 4;

bitflags! {
    /// Verdicts recorded on a node by the post-build analysis.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NodeFlags: u32 {
        /// An outgoing device ID range overlaps another range into the same ITS group.
        const DEVICE_ID_OVERLAP = 1 << 0;
        /// An outgoing stream ID range overlaps another range into the same SMMU.
        const STREAM_ID_OVERLAP = 1 << 1;
        /// The SMMU's context bank interrupt IDs are not pairwise distinct.
        const CONTEXT_INTERRUPT_NOT_UNIQUE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct ArenaHeader {
    pub num_blocks: u32,
    pub num_smmus: u32,
    pub num_pci_rcs: u32,
    pub num_named_components: u32,
    pub num_its_groups: u32,
    pub num_pmcgs: u32,
    /// Bytes of the arena in use, header included.
    pub used: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct BlockHeader {
    pub kind: u8,
    pub reserved: [u8; 3],
    pub num_maps: u32,
    pub flags: u32,
    pub data_len: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, packed)]
pub(crate) struct MapSlot {
    pub input_base: u32,
    pub id_count: u32,
    pub output_base: u32,
    pub output_ref: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct ItsGroupData {
    pub its_count: u32,
}

#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub(crate) struct NamedComponentData {
    pub name: [u8; MAX_NAMED_COMPONENT_NAME],
    pub reserved: [u8; 2],
    pub cca: u32,
    pub smmu_ref: u32,
    pub reserved2: u32,
    pub smmu_base: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct RootComplexData {
    pub segment: u32,
    pub cca: u32,
    pub ats_attr: u32,
    pub smmu_ref: u32,
    pub smmu_base: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct SmmuData {
    pub base: u64,
    pub arch_major_rev: u32,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C, packed)]
pub(crate) struct PmcgData {
    pub base: u64,
    pub overflow_gsiv: u32,
    pub node_ref: u32,
    pub smmu_ref: u32,
    pub reserved: u32,
    pub smmu_base: u64,
}

packed_records! {
    unsafe impl ArenaHeader = 32;
    unsafe impl BlockHeader = 16;
    unsafe impl MapSlot = 16;
    unsafe impl ItsGroupData = 4;
    unsafe impl NamedComponentData = 172;
    unsafe impl RootComplexData = 24;
    unsafe impl SmmuData = 16;
    unsafe impl PmcgData = 32;
}

impl ArenaHeader {
    pub const SIZE: usize = 32;
}

impl BlockHeader {
    pub const SIZE: usize = 16;
}

impl MapSlot {
    pub const SIZE: usize = 16;
}

/// Offset of the `smmu_ref` field within the payloads that cache one.
pub(crate) const NAMED_COMPONENT_SMMU_REF_AT: usize = 156;
pub(crate) const ROOT_COMPLEX_SMMU_REF_AT: usize = 12;

/// Length of the payload prefix that decides whether two blocks are the same
/// node. Cached back-references to an SMMU come from edges and are excluded.
pub(crate) const fn identity_len(kind: NodeType) -> usize {
    match kind {
        NodeType::ItsGroup => 4,
        NodeType::NamedComponent => NAMED_COMPONENT_SMMU_REF_AT,
        NodeType::RootComplex => ROOT_COMPLEX_SMMU_REF_AT,
        NodeType::SmmuV1V2 | NodeType::SmmuV3 => 16,
        NodeType::Pmcg => 32,
    }
}

/// A block located in the arena, with its header copied out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Block {
    pub offset: u32,
    pub kind: NodeType,
    pub header: BlockHeader,
}

impl Block {
    /// Locate the block at `offset` in `arena`, which must already be
    /// trimmed to the bytes in use.
    pub fn at(arena: &[u8], offset: u32) -> Option<Self> {
        let start = offset as usize;
        if start < ArenaHeader::SIZE {
            return None;
        }
        let header = BlockHeader::read_at(arena, start)?;
        let kind = NodeType::from_raw(header.kind)?;
        let block = Self {
            offset,
            kind,
            header,
        };
        (block.end() <= arena.len()).then_some(block)
    }

    pub fn payload_start(&self) -> usize {
        self.offset as usize + BlockHeader::SIZE
    }

    pub fn maps_start(&self) -> usize {
        self.payload_start() + self.header.data_len as usize
    }

    pub fn num_maps(&self) -> u32 {
        self.header.num_maps
    }

    /// Offset one past the last byte of the block.
    pub fn end(&self) -> usize {
        self.maps_start() + self.header.num_maps as usize * MapSlot::SIZE
    }

    pub fn flags(&self) -> NodeFlags {
        NodeFlags::from_bits_retain(self.header.flags)
    }

    pub fn payload<T: FromBytes>(&self, arena: &[u8]) -> Option<T> {
        T::read_at(arena, self.payload_start())
    }

    /// Returns the `index`th outgoing edge. Meaningless for ITS groups.
    pub fn map(&self, arena: &[u8], index: u32) -> Option<MapSlot> {
        if index >= self.header.num_maps || self.kind == NodeType::ItsGroup {
            return None;
        }
        MapSlot::read_at(arena, self.maps_start() + index as usize * MapSlot::SIZE)
    }

    /// Returns the `index`th identifier of an ITS group.
    pub fn its_id(&self, arena: &[u8], index: u32) -> Option<u32> {
        let count = self.payload::<ItsGroupData>(arena)?.its_count;
        if self.kind != NodeType::ItsGroup || index >= count {
            return None;
        }
        u32::read_at(arena, self.maps_start() + index as usize * 4)
    }

    /// Payload prefix that identifies this node for deduplication.
    pub fn identity<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        let start = self.payload_start();
        arena.get(start..start + identity_len(self.kind)).unwrap_or(&[])
    }

    /// Identifiers of an ITS group, in table order. Empty for other kinds.
    pub fn its_ids<'a>(&self, arena: &'a [u8]) -> impl Iterator<Item = u32> + use<'a> {
        let block = *self;
        let count = if block.kind == NodeType::ItsGroup {
            block.payload::<ItsGroupData>(arena).map_or(0, |group| group.its_count)
        } else {
            0
        };
        (0..count).map_while(move |index| block.its_id(arena, index))
    }
}

/// Iterator over the blocks of a built arena, in arena order.
pub(crate) struct BlockIter<'a> {
    arena: &'a [u8],
    offset: usize,
    remaining: u32,
}

impl<'a> BlockIter<'a> {
    pub fn new(arena: &'a [u8], num_blocks: u32) -> Self {
        Self {
            arena,
            offset: ArenaHeader::SIZE,
            remaining: num_blocks,
        }
    }
}

impl Iterator for BlockIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let block = Block::at(self.arena, u32::try_from(self.offset).ok()?)?;
        self.offset = block.end();
        self.remaining -= 1;
        Some(block)
    }
}

/// Copy `name` into a fixed, NUL-terminated buffer, truncating if needed.
pub(crate) fn fixed_name(name: &[u8]) -> [u8; MAX_NAMED_COMPONENT_NAME] {
    let mut out = [0u8; MAX_NAMED_COMPONENT_NAME];
    let len = name.len().min(MAX_NAMED_COMPONENT_NAME - 1);
    out[..len].copy_from_slice(&name[..len]);
    out
}
