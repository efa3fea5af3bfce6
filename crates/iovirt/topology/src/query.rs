//! Topology queries.
//!
//! Per-class accessors take an index within the class ("the second SMMU")
//! and a field selector. Nothing here overloads zero: absent values are
//! reported through [`QueryError`] or `Option`.

use iovirt_iort::NodeType;

use crate::arena::Topology;
use crate::block::{
    Block, ItsGroupData, MAX_NAMED_COMPONENT_NAME, NamedComponentData, NodeFlags, PmcgData,
    RootComplexData, SmmuData,
};
use crate::error::QueryError;
use crate::view::{IdMappingEdge, NodeClass, NodeRef, NodeView};

/// SMMU fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmuInfo {
    /// Architecture major revision (2 or 3).
    ArchMajorRev,
    /// Base address of the register frame.
    Base,
    /// Arena offset of the node.
    Node,
}

/// Root complex fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcInfo {
    /// PCI segment number.
    Segment,
    /// Cache coherency attribute.
    MemAttribute,
    /// ATS attribute.
    AtsAttribute,
    /// Arena offset of the node.
    Node,
    /// Base of the first SMMU the root complex maps onto.
    SmmuBase,
}

/// Named component fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedComponentInfo {
    /// Cache coherency attribute.
    CcaAttribute,
    /// Base of the first SMMU the component maps onto.
    SmmuBase,
    /// Arena offset of the node.
    Node,
}

/// PMCG fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmcgInfo {
    /// Base address of page 0.
    Base,
    /// Overflow interrupt ID.
    OverflowGsiv,
    /// Arena offset of the node.
    Node,
    /// Arena offset of the node the group instruments.
    NodeRef,
    /// Base of the SMMU the group instruments.
    NodeSmmuBase,
}

/// Result of translating a requester ID through the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device ID presented to the ITS.
    pub device_id: u32,
    /// Stream ID, when the root complex sits behind an SMMU.
    pub stream_id: Option<u32>,
    /// First ITS identifier of the group the device ID lands in.
    pub its_id: Option<u32>,
}

impl Topology<'_> {
    /// Number of nodes in `class`.
    #[must_use]
    pub fn count(&self, class: NodeClass) -> usize {
        let header = self.header();
        let count = match class {
            NodeClass::Smmu => header.num_smmus,
            NodeClass::RootComplex => header.num_pci_rcs,
            NodeClass::NamedComponent => header.num_named_components,
            NodeClass::ItsGroup => header.num_its_groups,
            NodeClass::Pmcg => header.num_pmcgs,
        };
        count as usize
    }

    /// Total number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.header().num_blocks as usize
    }

    /// Returns `true` if the topology has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns an iterator over every node in arena order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeView<'_>> {
        let arena = self.as_bytes();
        self.blocks().map(move |block| NodeView::new(arena, block))
    }

    /// Returns the node at `node`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidReference`] if `node` does not name a
    /// node of this topology.
    pub fn node(&self, node: NodeRef) -> Result<NodeView<'_>, QueryError> {
        Ok(NodeView::new(self.as_bytes(), self.block(node.offset())?))
    }

    /// Returns the `index`th node of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] if the class has fewer nodes.
    pub fn nth(&self, class: NodeClass, index: usize) -> Result<NodeView<'_>, QueryError> {
        Ok(NodeView::new(self.as_bytes(), self.nth_block(class, index)?))
    }

    /// Analysis verdicts of `node`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidReference`] for a foreign reference.
    pub fn node_flags(&self, node: NodeRef) -> Result<NodeFlags, QueryError> {
        Ok(self.block(node.offset())?.flags())
    }

    /// Read a field of the `index`th SMMU.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index.
    pub fn smmu_info(&self, index: usize, info: SmmuInfo) -> Result<u64, QueryError> {
        let block = self.nth_block(NodeClass::Smmu, index)?;
        let smmu: SmmuData = self.payload(&block)?;
        Ok(match info {
            SmmuInfo::ArchMajorRev => u64::from(smmu.arch_major_rev),
            SmmuInfo::Base => smmu.base,
            SmmuInfo::Node => u64::from(block.offset),
        })
    }

    /// Read a field of the `index`th root complex.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index and
    /// [`QueryError::NotBehindIommu`] for [`RcInfo::SmmuBase`] when no
    /// mapping lands on an SMMU.
    pub fn pcie_rc_info(&self, index: usize, info: RcInfo) -> Result<u64, QueryError> {
        let block = self.nth_block(NodeClass::RootComplex, index)?;
        let rc: RootComplexData = self.payload(&block)?;
        Ok(match info {
            RcInfo::Segment => u64::from(rc.segment),
            RcInfo::MemAttribute => u64::from(rc.cca),
            RcInfo::AtsAttribute => u64::from(rc.ats_attr),
            RcInfo::Node => u64::from(block.offset),
            RcInfo::SmmuBase => {
                if rc.smmu_ref == 0 {
                    return Err(QueryError::NotBehindIommu);
                }
                rc.smmu_base
            }
        })
    }

    /// Read a field of the `index`th named component.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index and
    /// [`QueryError::NotBehindIommu`] for [`NamedComponentInfo::SmmuBase`]
    /// when no mapping lands on an SMMU.
    pub fn named_component_info(
        &self,
        index: usize,
        info: NamedComponentInfo,
    ) -> Result<u64, QueryError> {
        let block = self.nth_block(NodeClass::NamedComponent, index)?;
        let nc: NamedComponentData = self.payload(&block)?;
        Ok(match info {
            NamedComponentInfo::CcaAttribute => u64::from(nc.cca),
            NamedComponentInfo::Node => u64::from(block.offset),
            NamedComponentInfo::SmmuBase => {
                if nc.smmu_ref == 0 {
                    return Err(QueryError::NotBehindIommu);
                }
                nc.smmu_base
            }
        })
    }

    /// Namespace path of the `index`th named component, without the NUL.
    ///
    /// At most 149 bytes of the firmware name are kept.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index.
    pub fn named_component_name(&self, index: usize) -> Result<&[u8], QueryError> {
        let block = self.nth_block(NodeClass::NamedComponent, index)?;
        let start = block.payload_start();
        let name = self
            .as_bytes()
            .get(start..start + MAX_NAMED_COMPONENT_NAME)
            .ok_or(QueryError::InvalidReference {
                offset: block.offset,
            })?;
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Ok(&name[..len])
    }

    /// Read a field of the `index`th PMCG.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index,
    /// [`QueryError::NotFound`] for [`PmcgInfo::NodeRef`] when the group
    /// instruments no node, and [`QueryError::NotBehindIommu`] for
    /// [`PmcgInfo::NodeSmmuBase`] when that node is not an SMMU.
    pub fn pmcg_info(&self, index: usize, info: PmcgInfo) -> Result<u64, QueryError> {
        let block = self.nth_block(NodeClass::Pmcg, index)?;
        let pmcg: PmcgData = self.payload(&block)?;
        Ok(match info {
            PmcgInfo::Base => pmcg.base,
            PmcgInfo::OverflowGsiv => u64::from(pmcg.overflow_gsiv),
            PmcgInfo::Node => u64::from(block.offset),
            PmcgInfo::NodeRef => {
                if pmcg.node_ref == 0 {
                    return Err(QueryError::NotFound);
                }
                u64::from(pmcg.node_ref)
            }
            PmcgInfo::NodeSmmuBase => {
                if pmcg.smmu_ref == 0 {
                    return Err(QueryError::NotBehindIommu);
                }
                pmcg.smmu_base
            }
        })
    }

    /// Number of ITS blocks in the `group`th ITS group.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad group index.
    pub fn its_group_size(&self, group: usize) -> Result<u32, QueryError> {
        let block = self.nth_block(NodeClass::ItsGroup, group)?;
        Ok(self.payload::<ItsGroupData>(&block)?.its_count)
    }

    /// ITS identifier at `block_index` within the `group`th ITS group.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] if either index is out of range.
    pub fn its_id(&self, group: usize, block_index: u32) -> Result<u32, QueryError> {
        let block = self.nth_block(NodeClass::ItsGroup, group)?;
        let count = self.payload::<ItsGroupData>(&block)?.its_count;
        block
            .its_id(self.as_bytes(), block_index)
            .ok_or(QueryError::IndexOutOfRange {
                index: block_index as usize,
                count: count as usize,
            })
    }

    /// Position of `its_id` within the `group`th ITS group.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad group index and
    /// [`QueryError::NotFound`] if the group does not contain `its_id`.
    pub fn its_block_index(&self, group: usize, its_id: u32) -> Result<u32, QueryError> {
        let view = self.nth(NodeClass::ItsGroup, group)?;
        view.its_ids()
            .position(|id| id == its_id)
            .and_then(|index| u32::try_from(index).ok())
            .ok_or(QueryError::NotFound)
    }

    /// Index of the first ITS group containing `its_id`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NotFound`] if no group contains it.
    pub fn its_group_index(&self, its_id: u32) -> Result<usize, QueryError> {
        self.nodes()
            .filter(|node| node.kind() == NodeType::ItsGroup)
            .position(|group| group.its_ids().any(|id| id == its_id))
            .ok_or(QueryError::NotFound)
    }

    /// Index of the first root complex with PCI segment `segment`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NotFound`] if there is none.
    pub fn rc_index(&self, segment: u32) -> Result<usize, QueryError> {
        let arena = self.as_bytes();
        self.blocks()
            .filter(|block| block.kind == NodeType::RootComplex)
            .position(|block| {
                block
                    .payload::<RootComplexData>(arena)
                    .is_some_and(|rc| rc.segment == segment)
            })
            .ok_or(QueryError::NotFound)
    }

    /// Translate requester ID `rid` on PCI segment `segment` into the device
    /// ID seen by the ITS.
    ///
    /// The last root complex of the segment whose mappings cover `rid`
    /// decides the first hop. It may land on an ITS group (the result is the
    /// device ID) or on an SMMU (the result is a stream ID, translated again
    /// through the SMMU's mappings onto an ITS group).
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoMapping`] if a hop finds no covering range and
    /// [`QueryError::UnsupportedHop`] if a hop lands on a node that cannot
    /// appear at that step.
    pub fn device_info(&self, rid: u32, segment: u32) -> Result<DeviceInfo, QueryError> {
        let (id, target) = self.rc_translate(rid, segment)?;
        let node = self.node(target)?;
        match node.kind() {
            NodeType::ItsGroup => Ok(DeviceInfo {
                device_id: id,
                stream_id: None,
                its_id: node.its_ids().next(),
            }),
            NodeType::SmmuV1V2 | NodeType::SmmuV3 => {
                let (device_id, next) = translate(node.id_mappings(), id).ok_or_else(|| {
                    log::debug!("iovirt: no mapping for stream ID {id:#x} in {target}");
                    QueryError::NoMapping
                })?;
                let its = self.node(next)?;
                if its.kind() != NodeType::ItsGroup {
                    return Err(QueryError::UnsupportedHop { kind: its.kind() });
                }
                Ok(DeviceInfo {
                    device_id,
                    stream_id: Some(id),
                    its_id: its.its_ids().next(),
                })
            }
            kind => Err(QueryError::UnsupportedHop { kind }),
        }
    }

    /// Base of the SMMU that requester ID `rid` on `segment` is translated by.
    ///
    /// Returns `Ok(None)` when the root complex maps `rid` straight onto an
    /// ITS group, or onto an SMMU that has no mapping for the stream ID.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoMapping`] if no root complex of the segment
    /// covers `rid`.
    pub fn rc_smmu_base(&self, segment: u32, rid: u32) -> Result<Option<u64>, QueryError> {
        Ok(self.rc_smmu(segment, rid)?.map(|(_, smmu)| smmu.base))
    }

    /// Index, among SMMUs, of the SMMU that requester ID `rid` on `segment`
    /// is translated by.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoMapping`] if no root complex covers `rid` and
    /// [`QueryError::NotBehindIommu`] if the root complex bypasses every SMMU.
    pub fn rc_smmu_index(&self, segment: u32, rid: u32) -> Result<usize, QueryError> {
        let (smmu, _) = self
            .rc_smmu(segment, rid)?
            .ok_or(QueryError::NotBehindIommu)?;
        self.blocks()
            .filter(|block| block.kind.is_smmu())
            .position(|block| block.offset == smmu.offset())
            .ok_or(QueryError::InvalidReference {
                offset: smmu.offset(),
            })
    }

    /// Returns `true` if the `index`th SMMU's context interrupt IDs are
    /// pairwise distinct.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index.
    pub fn smmu_has_unique_ctx_intid(&self, index: usize) -> Result<bool, QueryError> {
        let block = self.nth_block(NodeClass::Smmu, index)?;
        Ok(!block.flags().contains(NodeFlags::CONTEXT_INTERRUPT_NOT_UNIQUE))
    }

    /// Returns `true` if no stream ID range of the `index`th root complex
    /// overlaps another range into the same SMMU.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::IndexOutOfRange`] for a bad index.
    pub fn rc_has_unique_rid_strid_map(&self, index: usize) -> Result<bool, QueryError> {
        let block = self.nth_block(NodeClass::RootComplex, index)?;
        Ok(!block.flags().contains(NodeFlags::STREAM_ID_OVERLAP))
    }

    /// First hop: the last root complex on `segment`, in graph order, that
    /// covers `rid`.
    fn rc_translate(&self, rid: u32, segment: u32) -> Result<(u32, NodeRef), QueryError> {
        let arena = self.as_bytes();
        self.nodes()
            .filter(|node| {
                node.kind() == NodeType::RootComplex
                    && node
                        .block()
                        .payload::<RootComplexData>(arena)
                        .is_some_and(|rc| rc.segment == segment)
            })
            .filter_map(|rc| translate(rc.id_mappings(), rid))
            .last()
            .ok_or_else(|| {
                log::debug!("iovirt: no mapping for RID {rid:#x} on segment {segment}");
                QueryError::NoMapping
            })
    }

    /// The SMMU `rid` passes through, with the SMMU's payload.
    fn rc_smmu(&self, segment: u32, rid: u32) -> Result<Option<(NodeRef, SmmuData)>, QueryError> {
        let (stream_id, target) = self.rc_translate(rid, segment)?;
        let node = self.node(target)?;
        if !node.kind().is_smmu() || translate(node.id_mappings(), stream_id).is_none() {
            return Ok(None);
        }
        let smmu = self.payload::<SmmuData>(node.block())?;
        Ok(Some((target, smmu)))
    }

    fn block(&self, offset: u32) -> Result<Block, QueryError> {
        Block::at(self.as_bytes(), offset).ok_or(QueryError::InvalidReference { offset })
    }

    fn nth_block(&self, class: NodeClass, index: usize) -> Result<Block, QueryError> {
        let count = self.count(class);
        if index >= count {
            return Err(QueryError::IndexOutOfRange { index, count });
        }
        self.blocks()
            .filter(|block| class.contains(block.kind))
            .nth(index)
            .ok_or(QueryError::IndexOutOfRange { index, count })
    }

    fn payload<T: iovirt_binparse::FromBytes>(&self, block: &Block) -> Result<T, QueryError> {
        block
            .payload(self.as_bytes())
            .ok_or(QueryError::InvalidReference {
                offset: block.offset,
            })
    }
}

/// Translate `id` through the first covering mapping.
fn translate(
    mut mappings: impl Iterator<Item = IdMappingEdge>,
    id: u32,
) -> Option<(u32, NodeRef)> {
    mappings.find_map(|edge| Some((edge.translate(id)?, edge.output)))
}
