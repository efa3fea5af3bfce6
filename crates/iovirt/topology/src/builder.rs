//! Topology builder.
//!
//! Walks the IORT in table order and resolves each node into an arena block.
//! Mapping targets are resolved recursively before the edge is recorded, so
//! a block's `output_ref`s always name blocks that already exist. A candidate
//! is compared against every committed block of the same kind before it
//! takes any arena space; an identical one is reused instead.

use heapless::Vec;
use iovirt_binparse::{AsBytes, FromBytes};
use iovirt_iort::node::CCA_MASK;
use iovirt_iort::{AcpiError, Iort, NodeBody, NodeType};

use crate::block::{
    ArenaHeader, Block, BlockHeader, BlockIter, ITS_IDS_PER_SLOT, ItsGroupData, MapSlot,
    NamedComponentData, NodeFlags, PmcgData, RootComplexData, SmmuData, fixed_name, identity_len,
};
use crate::config::SmmuOverride;
use crate::ctx_int::gsivs_unique;
use crate::error::BuildError;

/// Deepest chain of mapping references the builder follows.
pub(crate) const MAX_NESTING: usize = 32;

/// Where a resolved candidate ended up.
enum Placement {
    /// An identical block was already committed at this offset.
    Existing(u32),
    /// The candidate was written at the cursor and awaits its commit.
    Staged(Block),
}

pub(crate) struct Builder<'t, 'b> {
    iort: Option<Iort<'t>>,
    arena: &'b mut [u8],
    /// Usable bytes: the arena length, clamped so offsets fit in 32 bits.
    capacity: usize,
    cursor: usize,
    header: ArenaHeader,
    in_progress: Vec<u32, MAX_NESTING>,
}

impl<'t, 'b> Builder<'t, 'b> {
    /// Prepare `arena` for a build. The whole buffer is zeroed.
    pub fn new(arena: &'b mut [u8], iort: Option<Iort<'t>>) -> Result<Self, BuildError> {
        if arena.len() < ArenaHeader::SIZE {
            return Err(BuildError::ArenaTooSmall);
        }
        arena.fill(0);
        let capacity = arena.len().min(u32::MAX as usize);
        Ok(Self {
            iort,
            arena,
            capacity,
            cursor: ArenaHeader::SIZE,
            header: ArenaHeader::default(),
            in_progress: Vec::new(),
        })
    }

    /// Add a block for every node of the table, in table order.
    pub fn add_table(&mut self) -> Result<(), BuildError> {
        let Some(iort) = self.iort else {
            return Ok(());
        };
        log::debug!(
            "iovirt: IORT rev {} with {} nodes at offset {:#x}",
            iort.header.revision,
            iort.node_count,
            iort.node_offset
        );
        for node in iort.nodes() {
            self.resolve(node?.offset())?;
        }
        Ok(())
    }

    /// Add the single SMMU block that stands in for the firmware table.
    pub fn add_override(&mut self, smmu: &SmmuOverride) -> Result<(), BuildError> {
        let kind = match smmu.arch_major_rev {
            2 => NodeType::SmmuV1V2,
            3 => NodeType::SmmuV3,
            revision => return Err(BuildError::UnsupportedSmmuRevision { revision }),
        };
        let data = SmmuData {
            base: smmu.base,
            arch_major_rev: smmu.arch_major_rev,
            reserved: 0,
        };
        let block = self.stage(kind, data.as_bytes(), 0, NodeFlags::empty())?;
        self.commit(&block);
        log::info!(
            "iovirt: SMMUv{} override at {:#x}, firmware table ignored",
            smmu.arch_major_rev,
            smmu.base
        );
        Ok(())
    }

    /// Write the arena header and return it.
    pub fn finish(self) -> ArenaHeader {
        let mut header = self.header;
        // The cursor never exceeds the clamped capacity.
        header.used = u32::try_from(self.cursor).unwrap_or(u32::MAX);
        let _ = header.write_at(self.arena, 0);
        header
    }

    /// Resolve the node at table offset `raw` into a block and return the
    /// block's arena offset.
    fn resolve(&mut self, raw: u32) -> Result<u32, BuildError> {
        if self.in_progress.contains(&raw) {
            return Err(BuildError::ReferenceCycle { offset: raw });
        }
        if self.in_progress.push(raw).is_err() {
            return Err(BuildError::NestingTooDeep { offset: raw });
        }
        let result = self.add_node(raw);
        self.in_progress.pop();
        result
    }

    fn add_node(&mut self, raw: u32) -> Result<u32, BuildError> {
        let Some(iort) = self.iort else {
            return Err(AcpiError::OutOfBounds { offset: raw }.into());
        };
        let node = iort.node_at(raw)?;
        let kind = node.kind().ok_or(BuildError::UnknownNodeType {
            offset: raw,
            node_type: node.node_type(),
        })?;
        log::debug!("iovirt: IORT node at {raw:#x}: {kind}");

        let body = node.body()?;
        if let NodeBody::ItsGroup { identifiers } = body {
            return self.add_its_group(identifiers.iter(), identifiers.len());
        }

        let mappings = node.id_mappings()?;
        let num_maps = node.mapping_count();
        let mut flags = NodeFlags::empty();

        let placement = match body {
            NodeBody::NamedComponent {
                memory_properties,
                device_name,
                ..
            } => {
                let data = NamedComponentData {
                    name: fixed_name(device_name),
                    reserved: [0; 2],
                    cca: cca(memory_properties),
                    smmu_ref: 0,
                    reserved2: 0,
                    smmu_base: 0,
                };
                self.place(kind, data.as_bytes(), num_maps, flags)?
            }
            NodeBody::RootComplex {
                memory_properties,
                ats_attribute,
                pci_segment_number,
                ..
            } => {
                let data = RootComplexData {
                    segment: pci_segment_number,
                    cca: cca(memory_properties),
                    ats_attr: ats_attribute,
                    smmu_ref: 0,
                    smmu_base: 0,
                };
                self.place(kind, data.as_bytes(), num_maps, flags)?
            }
            NodeBody::Smmu {
                base_address,
                context_interrupts,
                ..
            } => {
                if !gsivs_unique(context_interrupts.iter()) {
                    flags |= NodeFlags::CONTEXT_INTERRUPT_NOT_UNIQUE;
                }
                let data = SmmuData {
                    base: base_address,
                    arch_major_rev: 2,
                    reserved: 0,
                };
                self.place(kind, data.as_bytes(), num_maps, flags)?
            }
            NodeBody::SmmuV3 { base_address, .. } => {
                let data = SmmuData {
                    base: base_address,
                    arch_major_rev: 3,
                    reserved: 0,
                };
                self.place(kind, data.as_bytes(), num_maps, flags)?
            }
            NodeBody::Pmcg {
                page0_base,
                overflow_gsiv,
                node_reference,
                ..
            } => {
                // The instrumented node goes in first so its offset is known.
                let node_ref = if node_reference == 0 {
                    0
                } else {
                    self.resolve(node_reference)?
                };
                let (smmu_ref, smmu_base) = self.smmu_behind(node_ref).unwrap_or((0, 0));
                let data = PmcgData {
                    base: page0_base,
                    overflow_gsiv,
                    node_ref,
                    smmu_ref,
                    reserved: 0,
                    smmu_base,
                };
                self.place(kind, data.as_bytes(), num_maps, flags)?
            }
            NodeBody::ItsGroup { .. } | NodeBody::Unknown { .. } => {
                return Err(BuildError::UnknownNodeType {
                    offset: raw,
                    node_type: node.node_type(),
                });
            }
        };

        let block = match placement {
            Placement::Existing(offset) => return Ok(offset),
            Placement::Staged(block) => block,
        };
        self.commit(&block);
        if flags.contains(NodeFlags::CONTEXT_INTERRUPT_NOT_UNIQUE) {
            log::warn!(
                "iovirt: SMMU block at {:#x} has duplicate context interrupt IDs",
                block.offset
            );
        }

        for (index, mapping) in mappings.enumerate() {
            let target = self.resolve(mapping.output_reference)?;
            let slot = MapSlot {
                input_base: mapping.input_base,
                id_count: mapping.id_count,
                output_base: mapping.output_base,
                output_ref: target,
            };
            let (input, count, output) = (slot.input_base, slot.id_count, slot.output_base);
            log::debug!("iovirt:   map {input:#x}+{count:#x} -> {output:#x} in block {target:#x}");
            let at = block.maps_start() + index * MapSlot::SIZE;
            slot.write_at(self.arena, at).ok_or(self.exhausted(at + MapSlot::SIZE))?;

            if matches!(kind, NodeType::RootComplex | NodeType::NamedComponent) {
                self.cache_smmu(&block, target);
            }
        }
        Ok(block.offset)
    }

    fn add_its_group(
        &mut self,
        identifiers: impl Iterator<Item = u32> + Clone,
        count: usize,
    ) -> Result<u32, BuildError> {
        // An ITS group is counted from a u32 field, so its length fits.
        let its_count = u32::try_from(count).unwrap_or(u32::MAX);
        let data = ItsGroupData { its_count };
        if let Some(existing) =
            self.find_existing(NodeType::ItsGroup, data.as_bytes(), identifiers.clone())
        {
            log::debug!("iovirt:   same as block at {existing:#x}");
            return Ok(existing);
        }

        let block = self.stage(
            NodeType::ItsGroup,
            data.as_bytes(),
            its_count.div_ceil(ITS_IDS_PER_SLOT),
            NodeFlags::empty(),
        )?;
        for (index, id) in identifiers.enumerate() {
            let _ = id.write_at(self.arena, block.maps_start() + index * 4);
        }
        self.commit(&block);
        Ok(block.offset)
    }

    /// Reuse an identical committed block, or stage a new one.
    fn place(
        &mut self,
        kind: NodeType,
        payload: &[u8],
        num_maps: u32,
        flags: NodeFlags,
    ) -> Result<Placement, BuildError> {
        if let Some(existing) = self.find_existing(kind, payload, core::iter::empty()) {
            log::debug!("iovirt:   same as block at {existing:#x}");
            return Ok(Placement::Existing(existing));
        }
        self.stage(kind, payload, num_maps, flags).map(Placement::Staged)
    }

    /// Write a candidate block at the cursor without committing it. The map
    /// slots are zeroed.
    fn stage(
        &mut self,
        kind: NodeType,
        payload: &[u8],
        num_maps: u32,
        flags: NodeFlags,
    ) -> Result<Block, BuildError> {
        let start = self.cursor;
        let end = (num_maps as usize)
            .checked_mul(MapSlot::SIZE)
            .and_then(|maps| maps.checked_add(start + BlockHeader::SIZE + payload.len()))
            .unwrap_or(usize::MAX);
        if end > self.capacity {
            return Err(self.exhausted(end));
        }

        let header = BlockHeader {
            kind: kind as u8,
            reserved: [0; 3],
            num_maps,
            flags: flags.bits(),
            data_len: u32::try_from(payload.len()).unwrap_or(u32::MAX),
        };
        self.arena[start..end].fill(0);
        header.write_at(self.arena, start).ok_or(self.exhausted(end))?;
        self.arena[start + BlockHeader::SIZE..][..payload.len()].copy_from_slice(payload);

        Ok(Block {
            offset: u32::try_from(start).map_err(|_| self.exhausted(end))?,
            kind,
            header,
        })
    }

    fn commit(&mut self, block: &Block) {
        self.cursor = block.end();
        let index = self.header.num_blocks;
        self.header.num_blocks = index + 1;
        let header = &mut self.header;
        match block.kind {
            NodeType::ItsGroup => header.num_its_groups += 1,
            NodeType::NamedComponent => header.num_named_components += 1,
            NodeType::RootComplex => header.num_pci_rcs += 1,
            NodeType::SmmuV1V2 | NodeType::SmmuV3 => header.num_smmus += 1,
            NodeType::Pmcg => header.num_pmcgs += 1,
        }
        log::debug!("iovirt: block {index} ({}) at {:#x}", block.kind, block.offset);
    }

    /// Look for a committed block of `kind` with the identity of `payload`
    /// and, for ITS groups, the same identifiers.
    fn find_existing(
        &self,
        kind: NodeType,
        payload: &[u8],
        its_ids: impl Iterator<Item = u32> + Clone,
    ) -> Option<u32> {
        let key = payload.get(..identity_len(kind))?;
        let committed = &self.arena[..self.cursor];
        BlockIter::new(committed, self.header.num_blocks)
            .find(|block| {
                block.kind == kind
                    && block.identity(committed) == key
                    && block.its_ids(committed).eq(its_ids.clone())
            })
            .map(|block| block.offset)
    }

    /// Returns the arena offset and base of the SMMU at `offset`, if that
    /// block is an SMMU.
    fn smmu_behind(&self, offset: u32) -> Option<(u32, u64)> {
        let committed = &self.arena[..self.cursor];
        let block = Block::at(committed, offset)?;
        if !block.kind.is_smmu() {
            return None;
        }
        let smmu: SmmuData = block.payload(committed)?;
        Some((offset, smmu.base))
    }

    /// Record the first SMMU a root complex or named component maps onto.
    fn cache_smmu(&mut self, block: &Block, target: u32) {
        let Some((smmu_ref, smmu_base)) = self.smmu_behind(target) else {
            return;
        };
        let at = block.payload_start();
        match block.kind {
            NodeType::RootComplex => {
                let Some(mut rc) = RootComplexData::read_at(self.arena, at) else {
                    return;
                };
                if rc.smmu_ref == 0 {
                    rc.smmu_ref = smmu_ref;
                    rc.smmu_base = smmu_base;
                    let _ = rc.write_at(self.arena, at);
                }
            }
            NodeType::NamedComponent => {
                let Some(mut nc) = NamedComponentData::read_at(self.arena, at) else {
                    return;
                };
                if nc.smmu_ref == 0 {
                    nc.smmu_ref = smmu_ref;
                    nc.smmu_base = smmu_base;
                    let _ = nc.write_at(self.arena, at);
                }
            }
            _ => {}
        }
    }

    fn exhausted(&self, needed: usize) -> BuildError {
        BuildError::ArenaExhausted {
            needed,
            capacity: self.capacity,
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn cca(memory_properties: u64) -> u32 {
    (memory_properties & CCA_MASK) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use iovirt_iort::writer::{IortWriter, Mapping};

    fn build(table: &[u8], buf: &mut [u8]) -> Result<ArenaHeader, BuildError> {
        let iort = Iort::from_bytes(table).unwrap();
        let mut builder = Builder::new(buf, Some(iort))?;
        builder.add_table()?;
        Ok(builder.finish())
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut w = IortWriter::new();
        let smmu = w.smmu_v3(0x1000, &[Mapping::new(0, 0xFF, 0, 0)]);
        w.patch_mapping_reference(smmu, 0, smmu);
        let table = w.finish();

        let mut buf = [0u8; 512];
        assert_eq!(
            build(&table, &mut buf).unwrap_err(),
            BuildError::ReferenceCycle { offset: smmu }
        );
    }

    #[test]
    fn long_reference_chain_is_rejected() {
        let mut w = IortWriter::new();
        let smmus: std::vec::Vec<u32> = (0..40u64)
            .map(|i| w.smmu_v3(0x1000_0000 + i * 0x2_0000, &[Mapping::new(0, 0xFF, 0, 0)]))
            .collect();
        let its = w.its_group(&[0]);
        for pair in smmus.windows(2) {
            w.patch_mapping_reference(pair[0], 0, pair[1]);
        }
        w.patch_mapping_reference(smmus[39], 0, its);
        let table = w.finish();

        let mut buf = [0u8; 4096];
        assert_eq!(
            build(&table, &mut buf).unwrap_err(),
            BuildError::NestingTooDeep {
                offset: smmus[MAX_NESTING]
            }
        );
    }

    #[test_case::test_case(6; "reserved memory range")]
    #[test_case::test_case(0x80; "vendor")]
    fn unknown_node_type_is_fatal(node_type: u8) {
        let mut w = IortWriter::new();
        let node = w.raw_node(node_type, &[0; 8]);
        let table = w.finish();

        let mut buf = [0u8; 256];
        assert_eq!(
            build(&table, &mut buf).unwrap_err(),
            BuildError::UnknownNodeType {
                offset: node,
                node_type
            }
        );
    }

    #[test]
    fn reference_outside_table_is_fatal() {
        let mut w = IortWriter::new();
        w.root_complex(0, &[Mapping::new(0, 0xFF, 0, 0xFFFF)]);
        let table = w.finish();

        let mut buf = [0u8; 256];
        assert_eq!(
            build(&table, &mut buf).unwrap_err(),
            BuildError::Table(AcpiError::OutOfBounds { offset: 0xFFFF })
        );
    }

    #[test]
    fn shared_target_is_built_once() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[7]);
        w.root_complex(0, &[Mapping::new(0, 0xFF, 0, its)]);
        w.root_complex(1, &[Mapping::new(0, 0xFF, 0x100, its)]);
        let table = w.finish();

        let mut buf = [0u8; 512];
        let header = build(&table, &mut buf).unwrap();
        assert_eq!({ header.num_its_groups }, 1);
        assert_eq!({ header.num_pci_rcs }, 2);
        assert_eq!({ header.num_blocks }, 3);
    }

    #[test]
    fn pmcg_caches_the_smmu_it_instruments() {
        let mut w = IortWriter::new();
        let smmu = w.smmu_v3(0x4000_0000, &[]);
        w.pmcg(0x4100_0000, 99, smmu);
        let table = w.finish();

        let mut buf = [0u8; 512];
        build(&table, &mut buf).unwrap();
        let arena_len = usize::try_from(ArenaHeader::read_at(&buf, 0).unwrap().used).unwrap();
        let arena = &buf[..arena_len];
        let pmcg = BlockIter::new(arena, 2)
            .find(|b| b.kind == NodeType::Pmcg)
            .unwrap();
        let data: PmcgData = pmcg.payload(arena).unwrap();
        assert_eq!({ data.smmu_base }, 0x4000_0000);
        assert_eq!({ data.node_ref }, ArenaHeader::SIZE as u32);
    }
}
