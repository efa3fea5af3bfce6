//! Type-specific IORT node payloads.
//!
//! Every node starts with a [`RawNodeHeader`](crate::RawNodeHeader); the
//! bytes after it depend on the node type. [`IortNode::body`] decodes them
//! into a [`NodeBody`]. Field offsets below are relative to the start of the
//! node, as in Arm DEN 0049.

use core::fmt;

use iovirt_binparse::FromBytes;

use crate::AcpiError;
use crate::iort::IortNode;

/// Mask applied to a node's memory access properties to extract the cache
/// coherency attribute (the low 32 bits).
pub const CCA_MASK: u64 = 0xFFFF_FFFF;

/// Size of one SMMUv1/v2 context interrupt entry (GSIV + flags).
const CONTEXT_INTERRUPT_SIZE: usize = 8;

/// IORT node types understood by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    /// ITS group: a set of GIC ITS identifiers.
    ItsGroup = 0,
    /// Named component: a platform device described in the namespace.
    NamedComponent = 1,
    /// PCI root complex.
    RootComplex = 2,
    /// SMMUv1 or SMMUv2.
    SmmuV1V2 = 3,
    /// SMMUv3.
    SmmuV3 = 4,
    /// Performance monitoring counter group.
    Pmcg = 5,
}

impl NodeType {
    /// Decode a raw node type byte.
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ItsGroup),
            1 => Some(Self::NamedComponent),
            2 => Some(Self::RootComplex),
            3 => Some(Self::SmmuV1V2),
            4 => Some(Self::SmmuV3),
            5 => Some(Self::Pmcg),
            _ => None,
        }
    }

    /// Returns `true` for both SMMU node types.
    #[must_use]
    pub const fn is_smmu(self) -> bool {
        matches!(self, Self::SmmuV1V2 | Self::SmmuV3)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ItsGroup => "ITS group",
            Self::NamedComponent => "named component",
            Self::RootComplex => "root complex",
            Self::SmmuV1V2 => "SMMUv1/v2",
            Self::SmmuV3 => "SMMUv3",
            Self::Pmcg => "PMCG",
        })
    }
}

/// Decoded type-specific payload of an IORT node.
#[derive(Debug, Clone, Copy)]
pub enum NodeBody<'a> {
    /// Type 0: ITS group.
    ItsGroup {
        /// The group's ITS identifiers.
        identifiers: ItsIdentifiers<'a>,
    },
    /// Type 1: named component.
    NamedComponent {
        /// Node flags.
        flags: u32,
        /// Cache coherency attribute, allocation hints and memory access flags.
        memory_properties: u64,
        /// Device memory address size limit, in bits.
        address_size_limit: u8,
        /// Namespace path of the device, without the NUL terminator.
        device_name: &'a [u8],
    },
    /// Type 2: PCI root complex.
    RootComplex {
        /// Cache coherency attribute, allocation hints and memory access flags.
        memory_properties: u64,
        /// ATS attribute (bit 0: ATS supported).
        ats_attribute: u32,
        /// PCI segment number.
        pci_segment_number: u32,
        /// Memory address size limit, in bits.
        memory_address_size_limit: u8,
    },
    /// Type 3: SMMUv1 or SMMUv2.
    Smmu {
        /// Base address of the SMMU register frame.
        base_address: u64,
        /// Length of the register frame.
        span: u64,
        /// SMMU model identifier.
        model: u32,
        /// SMMU flags.
        flags: u32,
        /// Context bank interrupts.
        context_interrupts: ContextInterrupts<'a>,
    },
    /// Type 4: SMMUv3.
    SmmuV3 {
        /// Base address of the SMMU register frame.
        base_address: u64,
        /// SMMUv3 flags.
        flags: u32,
        /// VATOS base address, or zero.
        vatos_address: u64,
        /// SMMUv3 model identifier.
        model: u32,
        /// Event queue interrupt.
        event_gsiv: u32,
        /// PRI queue interrupt.
        pri_gsiv: u32,
        /// Global error interrupt.
        gerr_gsiv: u32,
        /// Sync interrupt.
        sync_gsiv: u32,
        /// Proximity domain.
        proximity_domain: u32,
        /// Index of the ID mapping used for the SMMU's own MSIs.
        device_id_mapping_index: u32,
    },
    /// Type 5: performance monitoring counter group.
    Pmcg {
        /// Base address of page 0 of the counter group.
        page0_base: u64,
        /// Overflow interrupt, or zero if the group uses MSIs.
        overflow_gsiv: u32,
        /// Table offset of the node this group instruments.
        node_reference: u32,
        /// Base address of page 1 of the counter group.
        page1_base: u64,
    },
    /// A node type this crate does not decode.
    Unknown {
        /// The raw node type byte.
        node_type: u8,
    },
}

impl<'a> IortNode<'a> {
    /// Decode the node's type-specific payload.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::TruncatedData`] if the node is too short for its
    /// type, or [`AcpiError::OutOfBounds`] if an interrupt or identifier
    /// array runs past the end of the node.
    pub fn body(&self) -> Result<NodeBody<'a>, AcpiError> {
        let Some(kind) = self.kind() else {
            return Ok(NodeBody::Unknown {
                node_type: self.node_type(),
            });
        };
        let data = self.bytes();

        Ok(match kind {
            // its_count(u32) at +16, identifiers at +20
            NodeType::ItsGroup => {
                let count = read::<u32>(data, 16)?;
                let size = (count as usize)
                    .checked_mul(4)
                    .ok_or(self.out_of_bounds(20))?;
                let ids = data
                    .get(20..)
                    .and_then(|rest| rest.get(..size))
                    .ok_or(self.out_of_bounds(20))?;
                NodeBody::ItsGroup {
                    identifiers: ItsIdentifiers { data: ids },
                }
            }
            // flags(u32) at +16, memory_properties(u64) at +20,
            // address_size_limit(u8) at +28, device_name at +29
            NodeType::NamedComponent => {
                let name = data.get(29..).ok_or(AcpiError::TruncatedData)?;
                let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                NodeBody::NamedComponent {
                    flags: read(data, 16)?,
                    memory_properties: read(data, 20)?,
                    address_size_limit: read(data, 28)?,
                    device_name: &name[..len],
                }
            }
            // memory_properties(u64) at +16, ats_attribute(u32) at +24,
            // pci_segment_number(u32) at +28, memory_address_size_limit(u8) at +32
            NodeType::RootComplex => NodeBody::RootComplex {
                memory_properties: read(data, 16)?,
                ats_attribute: read(data, 24)?,
                pci_segment_number: read(data, 28)?,
                memory_address_size_limit: read(data, 32)?,
            },
            // base(u64) at +16, span(u64) at +24, model(u32) at +32, flags(u32) at +36,
            // context_interrupt_count(u32) at +44, context_interrupt_offset(u32) at +48
            NodeType::SmmuV1V2 => {
                let count = read::<u32>(data, 44)?;
                let offset = read::<u32>(data, 48)?;
                NodeBody::Smmu {
                    base_address: read(data, 16)?,
                    span: read(data, 24)?,
                    model: read(data, 32)?,
                    flags: read(data, 36)?,
                    context_interrupts: self.context_interrupts(offset, count)?,
                }
            }
            // base(u64) at +16, flags(u32) at +24, vatos(u64) at +32, model(u32) at +40,
            // event/pri/gerr/sync gsiv at +44..+60, proximity domain at +60,
            // device id mapping index at +64
            NodeType::SmmuV3 => NodeBody::SmmuV3 {
                base_address: read(data, 16)?,
                flags: read(data, 24)?,
                vatos_address: read(data, 32)?,
                model: read(data, 40)?,
                event_gsiv: read(data, 44)?,
                pri_gsiv: read(data, 48)?,
                gerr_gsiv: read(data, 52)?,
                sync_gsiv: read(data, 56)?,
                proximity_domain: read(data, 60)?,
                device_id_mapping_index: read(data, 64)?,
            },
            // page0 base(u64) at +16, overflow gsiv(u32) at +24,
            // node reference(u32) at +28, page1 base(u64) at +32
            NodeType::Pmcg => NodeBody::Pmcg {
                page0_base: read(data, 16)?,
                overflow_gsiv: read(data, 24)?,
                node_reference: read(data, 28)?,
                page1_base: read(data, 32)?,
            },
        })
    }

    fn context_interrupts(
        &self,
        offset: u32,
        count: u32,
    ) -> Result<ContextInterrupts<'a>, AcpiError> {
        if count == 0 {
            return Ok(ContextInterrupts { data: &[] });
        }
        let err = self.out_of_bounds(offset);
        let size = (count as usize)
            .checked_mul(CONTEXT_INTERRUPT_SIZE)
            .ok_or(err)?;
        let data = self
            .bytes()
            .get(offset as usize..)
            .and_then(|rest| rest.get(..size))
            .ok_or(err)?;
        Ok(ContextInterrupts { data })
    }

    fn out_of_bounds(&self, relative: u32) -> AcpiError {
        AcpiError::OutOfBounds {
            offset: self.offset().saturating_add(relative),
        }
    }
}

fn read<T: FromBytes>(data: &[u8], offset: usize) -> Result<T, AcpiError> {
    T::read_at(data, offset).ok_or(AcpiError::TruncatedData)
}

/// The identifier array of an ITS group.
#[derive(Debug, Clone, Copy)]
pub struct ItsIdentifiers<'a> {
    data: &'a [u8],
}

impl<'a> ItsIdentifiers<'a> {
    /// Number of identifiers in the group.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / 4
    }

    /// Returns `true` if the group has no identifiers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns an iterator over the identifiers.
    pub fn iter(&self) -> impl Iterator<Item = u32> + Clone + use<'a> {
        self.data
            .chunks_exact(4)
            .filter_map(|chunk| u32::read_from(chunk))
    }
}

/// The context bank interrupt array of an SMMUv1/v2 node.
///
/// Each entry is 64 bits wide: the GSIV in the low 32 bits and interrupt
/// flags in the high 32 bits.
#[derive(Debug, Clone, Copy)]
pub struct ContextInterrupts<'a> {
    data: &'a [u8],
}

impl<'a> ContextInterrupts<'a> {
    /// Number of context interrupts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / CONTEXT_INTERRUPT_SIZE
    }

    /// Returns `true` if the SMMU declares no context interrupts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns an iterator over the raw 64-bit entries.
    pub fn iter(&self) -> impl Iterator<Item = u64> + Clone + use<'a> {
        self.data
            .chunks_exact(CONTEXT_INTERRUPT_SIZE)
            .filter_map(|chunk| u64::read_from(chunk))
    }

    /// Returns an iterator over the interrupt IDs (the low 32 bits).
    #[allow(clippy::cast_possible_truncation)]
    pub fn gsivs(&self) -> impl Iterator<Item = u32> + Clone + use<'a> {
        self.iter().map(|entry| entry as u32)
    }
}
