//! IO Remapping Table (IORT) node walking.
//!
//! An IORT is a list of variable-length nodes addressed by byte offsets from
//! the start of the table. Nodes reference each other through the
//! `output_reference` field of their ID mappings (and, for PMCGs, through a
//! node reference), so a consumer needs random access by offset as well as a
//! table-order walk. Both are provided here, with every offset checked
//! against the table length before use.

use iovirt_binparse::{FromBytes, packed_records};

use crate::node::NodeType;
use crate::sdt::{SdtHeader, ValidatedTable};
use crate::{AcpiError, AcpiHandler};

/// IORT table signature.
pub const IORT_SIGNATURE: &[u8; 4] = b"IORT";

/// Raw IORT fields that follow the SDT header.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
struct IortHeaderFields {
    /// Number of nodes in the node array.
    node_count: u32,
    /// Offset of the first node from the start of the table.
    node_offset: u32,
    /// Reserved, must be zero.
    reserved: u32,
}

/// Header common to every IORT node.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct RawNodeHeader {
    /// Node type (see [`NodeType`]).
    pub node_type: u8,
    /// Length of the node in bytes, including this header.
    pub length: u16,
    /// Revision of the node structure.
    pub revision: u8,
    /// Unique node identifier (reserved before IORT revision 3).
    pub identifier: u32,
    /// Number of ID mappings.
    pub mapping_count: u32,
    /// Offset of the ID mapping array from the start of the node.
    pub mapping_offset: u32,
}

/// A single ID mapping record.
///
/// Maps input IDs `input_base..=input_base + id_count` onto output IDs
/// starting at `output_base` in the node at `output_reference`. `id_count` is
/// the number of IDs in the range minus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct IdMapping {
    /// Lowest input ID covered by the mapping.
    pub input_base: u32,
    /// Number of IDs in the range minus one.
    pub id_count: u32,
    /// Output ID corresponding to `input_base`.
    pub output_base: u32,
    /// Table offset of the node the range maps onto.
    pub output_reference: u32,
    /// Mapping flags (bit 0: single mapping).
    pub flags: u32,
}

packed_records! {
    unsafe impl IortHeaderFields = 12;
    unsafe impl RawNodeHeader = 16;
    unsafe impl IdMapping = 20;
}

impl RawNodeHeader {
    /// Size of the node header in bytes.
    pub const SIZE: usize = 16;
}

impl IdMapping {
    /// Size of an ID mapping record in bytes.
    pub const SIZE: usize = 20;
}

/// Parsed IORT table.
#[derive(Clone, Copy)]
pub struct Iort<'a> {
    /// The validated SDT header.
    pub header: SdtHeader,
    /// Number of nodes declared by the table.
    pub node_count: u32,
    /// Offset of the first node from the start of the table.
    pub node_offset: u32,
    /// The whole table, trimmed to its declared length.
    data: &'a [u8],
}

impl Iort<'static> {
    /// Parse an IORT from the given physical address.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::InvalidSignature`] if the table signature is not
    /// `IORT`, or [`AcpiError::InvalidChecksum`] if the checksum is invalid.
    pub fn parse(handler: &impl AcpiHandler, phys: u64) -> Result<Self, AcpiError> {
        let table = crate::sdt::load_table(handler, phys, IORT_SIGNATURE)?;
        Self::from_validated(table)
    }
}

impl<'a> Iort<'a> {
    /// Size of the SDT header plus the fixed IORT fields.
    pub const HEADER_SIZE: usize = SdtHeader::SIZE + 12;

    /// Parse an IORT that is already present in memory.
    ///
    /// # Errors
    ///
    /// Same as [`Iort::parse`], plus [`AcpiError::TruncatedData`] if the slice
    /// is shorter than the length declared in the header.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, AcpiError> {
        Self::from_validated(crate::sdt::validate_slice(data, IORT_SIGNATURE)?)
    }

    fn from_validated(table: ValidatedTable<'a>) -> Result<Self, AcpiError> {
        let fields = IortHeaderFields::read_at(table.data, SdtHeader::SIZE)
            .ok_or(AcpiError::TruncatedData)?;

        Ok(Self {
            header: table.header,
            node_count: fields.node_count,
            node_offset: fields.node_offset,
            data: table.data,
        })
    }

    /// Returns the raw table bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns the trusted table length in bytes.
    #[must_use]
    pub fn table_len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the table declares no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }

    /// Returns the node starting at `offset` bytes from the start of the table.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::OutOfBounds`] if the node header or the node's
    /// declared length runs past the end of the table, or if `offset` points
    /// into the table header. Returns [`AcpiError::TruncatedData`] if the node
    /// declares a length shorter than its own header.
    pub fn node_at(&self, offset: u32) -> Result<IortNode<'a>, AcpiError> {
        let start = offset as usize;
        if start < Self::HEADER_SIZE {
            return Err(AcpiError::OutOfBounds { offset });
        }

        let header =
            RawNodeHeader::read_at(self.data, start).ok_or(AcpiError::OutOfBounds { offset })?;
        let length = usize::from(header.length);
        if length < RawNodeHeader::SIZE {
            return Err(AcpiError::TruncatedData);
        }

        let end = start
            .checked_add(length)
            .ok_or(AcpiError::OutOfBounds { offset })?;
        let data = self
            .data
            .get(start..end)
            .ok_or(AcpiError::OutOfBounds { offset })?;

        Ok(IortNode {
            offset,
            header,
            data,
        })
    }

    /// Returns an iterator over the table's nodes in table order.
    ///
    /// The iterator yields at most `node_count` items and stops after the
    /// first error.
    #[must_use]
    pub fn nodes(&self) -> NodeIter<'a> {
        NodeIter {
            iort: *self,
            offset: self.node_offset,
            remaining: self.node_count,
        }
    }
}

/// A single IORT node, borrowed from the table.
#[derive(Debug, Clone, Copy)]
pub struct IortNode<'a> {
    offset: u32,
    header: RawNodeHeader,
    data: &'a [u8],
}

impl<'a> IortNode<'a> {
    /// Offset of this node from the start of the table.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Raw node type byte.
    #[must_use]
    pub fn node_type(&self) -> u8 {
        self.header.node_type
    }

    /// Decoded node type, or `None` for types this crate does not know.
    #[must_use]
    pub fn kind(&self) -> Option<NodeType> {
        NodeType::from_raw(self.header.node_type)
    }

    /// Node length in bytes, including the header.
    #[must_use]
    pub fn length(&self) -> u16 {
        self.header.length
    }

    /// Node structure revision.
    #[must_use]
    pub fn revision(&self) -> u8 {
        self.header.revision
    }

    /// Node identifier.
    #[must_use]
    pub fn identifier(&self) -> u32 {
        self.header.identifier
    }

    /// Number of ID mappings declared by the node.
    #[must_use]
    pub fn mapping_count(&self) -> u32 {
        self.header.mapping_count
    }

    /// The node's bytes, header included.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Returns an iterator over the node's ID mappings.
    ///
    /// # Errors
    ///
    /// Returns [`AcpiError::OutOfBounds`] if the mapping array does not lie
    /// entirely within the node.
    pub fn id_mappings(&self) -> Result<IdMappingIter<'a>, AcpiError> {
        let count = self.header.mapping_count;
        if count == 0 {
            return Ok(IdMappingIter {
                data: &[],
                remaining: 0,
            });
        }

        let out_of_bounds = AcpiError::OutOfBounds {
            offset: self.offset.saturating_add(self.header.mapping_offset),
        };
        let start = self.header.mapping_offset as usize;
        if start < RawNodeHeader::SIZE {
            return Err(out_of_bounds);
        }
        let size = (count as usize)
            .checked_mul(IdMapping::SIZE)
            .ok_or(out_of_bounds)?;
        let end = start.checked_add(size).ok_or(out_of_bounds)?;
        let data = self.data.get(start..end).ok_or(out_of_bounds)?;

        Ok(IdMappingIter {
            data,
            remaining: count,
        })
    }
}

/// Iterator over IORT nodes in table order.
pub struct NodeIter<'a> {
    iort: Iort<'a>,
    offset: u32,
    remaining: u32,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = Result<IortNode<'a>, AcpiError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        match self.iort.node_at(self.offset) {
            Ok(node) => {
                self.offset = self.offset.saturating_add(u32::from(node.length()));
                Some(Ok(node))
            }
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining as usize))
    }
}

/// Iterator over the ID mappings of one node.
pub struct IdMappingIter<'a> {
    data: &'a [u8],
    remaining: u32,
}

impl Iterator for IdMappingIter<'_> {
    type Item = IdMapping;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let mapping = IdMapping::read_from(self.data)?;
        self.data = self.data.get(IdMapping::SIZE..).unwrap_or(&[]);
        self.remaining -= 1;
        Some(mapping)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining as usize, Some(self.remaining as usize))
    }
}

impl ExactSizeIterator for IdMappingIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{IortWriter, Mapping};

    #[test]
    fn empty_table_has_no_nodes() {
        let table = IortWriter::new().finish();
        let iort = Iort::from_bytes(&table).unwrap();
        assert!(iort.is_empty());
        assert_eq!(iort.nodes().count(), 0);
        // A node-less table still has its header bytes.
        assert_eq!(iort.table_len(), table.len());
        assert_ne!(iort.table_len(), 0);
    }

    #[test]
    fn nodes_are_walked_in_table_order() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[1, 2]);
        let smmu = w.smmu_v3(0x2b40_0000, &[Mapping::new(0, 0xFF, 0, its)]);
        let table = w.finish();

        let iort = Iort::from_bytes(&table).unwrap();
        let offsets: Vec<u32> = iort.nodes().map(|n| n.unwrap().offset()).collect();
        assert_eq!(offsets, [its, smmu]);
        assert_eq!(iort.node_at(smmu).unwrap().kind(), Some(NodeType::SmmuV3));
    }

    #[test]
    fn id_mappings_are_decoded() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[0]);
        let rc = w.root_complex(
            0,
            &[
                Mapping::new(0, 0xFF, 0x100, its),
                Mapping::new(0x200, 0x1F, 0x400, its),
            ],
        );
        let table = w.finish();

        let iort = Iort::from_bytes(&table).unwrap();
        let node = iort.node_at(rc).unwrap();
        let maps: Vec<IdMapping> = node.id_mappings().unwrap().collect();
        assert_eq!(maps.len(), 2);
        assert_eq!({ maps[1].input_base }, 0x200);
        assert_eq!({ maps[1].output_reference }, its);
    }

    #[test]
    fn offset_inside_header_is_rejected() {
        let table = IortWriter::new().finish();
        let iort = Iort::from_bytes(&table).unwrap();
        assert_eq!(
            iort.node_at(0).err(),
            Some(AcpiError::OutOfBounds { offset: 0 })
        );
    }

    #[test]
    fn node_running_past_table_end_is_rejected() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[3]);
        let mut table = w.finish();
        // Stretch the node's length past the end of the table.
        let at = its as usize + 1;
        table[at..at + 2].copy_from_slice(&0x400u16.to_le_bytes());
        IortWriter::fix_checksum(&mut table);

        let iort = Iort::from_bytes(&table).unwrap();
        assert_eq!(
            iort.node_at(its).err(),
            Some(AcpiError::OutOfBounds { offset: its })
        );
        let walked: Vec<_> = iort.nodes().collect();
        assert_eq!(walked.len(), 1);
        assert!(walked[0].is_err());
    }

    #[test]
    fn node_count_beyond_table_stops_walk_with_error() {
        let mut w = IortWriter::new();
        w.its_group(&[3]);
        let mut table = w.finish();
        table[36..40].copy_from_slice(&5u32.to_le_bytes());
        IortWriter::fix_checksum(&mut table);

        let iort = Iort::from_bytes(&table).unwrap();
        let walked: Vec<_> = iort.nodes().collect();
        assert_eq!(walked.len(), 2);
        assert!(walked[0].is_ok());
        assert!(matches!(walked[1], Err(AcpiError::OutOfBounds { .. })));
    }

    #[test]
    fn mapping_array_outside_node_is_rejected() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[0]);
        let rc = w.root_complex(0, &[Mapping::new(0, 1, 0, its)]);
        let mut table = w.finish();
        // Claim far more mappings than the node holds.
        let at = rc as usize + 8;
        table[at..at + 4].copy_from_slice(&1000u32.to_le_bytes());
        IortWriter::fix_checksum(&mut table);

        let iort = Iort::from_bytes(&table).unwrap();
        let node = iort.node_at(rc).unwrap();
        assert!(matches!(
            node.id_mappings().err(),
            Some(AcpiError::OutOfBounds { .. })
        ));
    }
}
