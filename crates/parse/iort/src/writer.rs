//! IORT table writer.
//!
//! Emits well-formed IO Remapping Tables: SDT header, node array, ID mapping
//! arrays and checksum. Used to describe emulated platforms and to build
//! fixtures for the decoder and the topology builder. Nodes are appended in
//! call order and each call returns the new node's table offset, so a node
//! can only reference nodes added before it; use
//! [`IortWriter::patch_mapping_reference`] for forward or cyclic references.

use alloc::vec::Vec;

use iovirt_binparse::AsBytes;

use crate::iort::{IORT_SIGNATURE, IdMapping, Iort, RawNodeHeader};
use crate::sdt::{SdtHeader, checksum_byte};

/// One ID mapping to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Lowest input ID covered by the mapping.
    pub input_base: u32,
    /// Number of IDs in the range minus one.
    pub id_count: u32,
    /// Output ID corresponding to `input_base`.
    pub output_base: u32,
    /// Table offset of the target node.
    pub output_reference: u32,
    /// Mapping flags.
    pub flags: u32,
}

impl Mapping {
    /// A mapping with no flags set.
    #[must_use]
    pub const fn new(
        input_base: u32,
        id_count: u32,
        output_base: u32,
        output_reference: u32,
    ) -> Self {
        Self {
            input_base,
            id_count,
            output_base,
            output_reference,
            flags: 0,
        }
    }
}

/// Offsets of an emitted node, kept for later patching.
#[derive(Debug, Clone, Copy)]
struct EmittedNode {
    offset: u32,
    mapping_offset: u32,
    mapping_count: u32,
}

/// Builder for IORT tables.
#[derive(Debug, Default)]
pub struct IortWriter {
    nodes: Vec<u8>,
    emitted: Vec<EmittedNode>,
    revision: u8,
}

impl IortWriter {
    /// An empty table at IORT revision 3.
    #[must_use]
    pub fn new() -> Self {
        Self {
            revision: 3,
            ..Self::default()
        }
    }

    /// Append an ITS group with the given ITS identifiers.
    pub fn its_group(&mut self, identifiers: &[u32]) -> u32 {
        let mut payload = Vec::with_capacity(4 + identifiers.len() * 4);
        push(&mut payload, &len_u32(identifiers.len()));
        for id in identifiers {
            push(&mut payload, id);
        }
        self.node(0, 1, &payload, &[])
    }

    /// Append a named component.
    pub fn named_component(&mut self, name: &str, cca: u32, mappings: &[Mapping]) -> u32 {
        let mut payload = Vec::new();
        push(&mut payload, &0u32);
        push(&mut payload, &u64::from(cca));
        push(&mut payload, &48u8);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        self.node(1, 4, &payload, mappings)
    }

    /// Append a coherent root complex without ATS support.
    pub fn root_complex(&mut self, segment: u32, mappings: &[Mapping]) -> u32 {
        self.root_complex_with(segment, 1, 0, mappings)
    }

    /// Append a root complex with explicit coherency and ATS attributes.
    pub fn root_complex_with(
        &mut self,
        segment: u32,
        cca: u32,
        ats_attribute: u32,
        mappings: &[Mapping],
    ) -> u32 {
        let mut payload = Vec::new();
        push(&mut payload, &u64::from(cca));
        push(&mut payload, &ats_attribute);
        push(&mut payload, &segment);
        push(&mut payload, &48u8);
        push(&mut payload, &[0u8; 3]);
        self.node(2, 3, &payload, mappings)
    }

    /// Append an SMMUv2 with the given 64-bit context interrupt entries.
    pub fn smmu_v2(&mut self, base: u64, context_interrupts: &[u64], mappings: &[Mapping]) -> u32 {
        // Fixed fields end at +60; two global interrupt entries follow, then
        // the context interrupt array.
        const GLOBAL_INTERRUPTS_AT: u32 = 60;
        const CONTEXT_INTERRUPTS_AT: u32 = GLOBAL_INTERRUPTS_AT + 16;

        let mut payload = Vec::new();
        push(&mut payload, &base);
        push(&mut payload, &0x1_0000u64);
        push(&mut payload, &0u32);
        push(&mut payload, &0u32);
        push(&mut payload, &GLOBAL_INTERRUPTS_AT);
        push(&mut payload, &len_u32(context_interrupts.len()));
        push(&mut payload, &CONTEXT_INTERRUPTS_AT);
        push(&mut payload, &0u32);
        push(&mut payload, &0u32);
        push(&mut payload, &[0u32; 4]);
        for entry in context_interrupts {
            push(&mut payload, entry);
        }
        self.node(3, 3, &payload, mappings)
    }

    /// Append an SMMUv3.
    pub fn smmu_v3(&mut self, base: u64, mappings: &[Mapping]) -> u32 {
        let mut payload = Vec::new();
        push(&mut payload, &base);
        push(&mut payload, &0u32);
        push(&mut payload, &0u32);
        push(&mut payload, &0u64);
        push(&mut payload, &0u32);
        // event, pri, gerr and sync interrupts
        push(&mut payload, &[0u32; 4]);
        push(&mut payload, &0u32);
        push(&mut payload, &0u32);
        self.node(4, 4, &payload, mappings)
    }

    /// Append a PMCG instrumenting the node at `node_reference`.
    pub fn pmcg(&mut self, base: u64, overflow_gsiv: u32, node_reference: u32) -> u32 {
        let mut payload = Vec::new();
        push(&mut payload, &base);
        push(&mut payload, &overflow_gsiv);
        push(&mut payload, &node_reference);
        push(&mut payload, &base.wrapping_add(0x1_0000));
        self.node(5, 1, &payload, &[])
    }

    /// Append a node with an arbitrary type byte and payload and no mappings.
    pub fn raw_node(&mut self, node_type: u8, payload: &[u8]) -> u32 {
        self.node(node_type, 0, payload, &[])
    }

    /// Rewrite the `output_reference` of mapping `index` of the node at `node`.
    ///
    /// # Panics
    ///
    /// Panics if no node was emitted at `node` or it has fewer mappings.
    pub fn patch_mapping_reference(&mut self, node: u32, index: u32, reference: u32) {
        let emitted = self
            .emitted
            .iter()
            .find(|n| n.offset == node)
            .copied()
            .expect("no node emitted at this offset");
        assert!(index < emitted.mapping_count, "mapping index out of range");

        let at = (node - table_header_len()) as usize
            + emitted.mapping_offset as usize
            + index as usize * IdMapping::SIZE
            + 12;
        self.nodes[at..at + 4].copy_from_slice(&reference.to_le_bytes());
    }

    /// Finish the table: prepend the header and compute the checksum.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        let header_len = Iort::HEADER_SIZE;
        let total = header_len + self.nodes.len();

        let mut table = Vec::with_capacity(total);
        table.extend_from_slice(IORT_SIGNATURE);
        push(&mut table, &len_u32(total));
        table.push(self.revision);
        table.push(0);
        table.extend_from_slice(b"IOVIRT");
        table.extend_from_slice(b"TOPOLOGY");
        push(&mut table, &1u32);
        push(&mut table, &u32::from_le_bytes(*b"IOVT"));
        push(&mut table, &1u32);
        debug_assert_eq!(table.len(), SdtHeader::SIZE);

        push(&mut table, &len_u32(self.emitted.len()));
        push(&mut table, &table_header_len());
        push(&mut table, &0u32);
        table.extend_from_slice(&self.nodes);

        Self::fix_checksum(&mut table);
        table
    }

    /// Recompute the checksum byte of a table edited in place.
    pub fn fix_checksum(table: &mut [u8]) {
        table[9] = 0;
        table[9] = checksum_byte(table);
    }

    fn node(&mut self, node_type: u8, revision: u8, payload: &[u8], mappings: &[Mapping]) -> u32 {
        let offset = table_header_len() + len_u32(self.nodes.len());
        let fixed = RawNodeHeader::SIZE + payload.len().next_multiple_of(4);
        let length = fixed + mappings.len() * IdMapping::SIZE;

        let header = RawNodeHeader {
            node_type,
            length: u16::try_from(length).expect("IORT node exceeds 64 KiB"),
            revision,
            identifier: len_u32(self.emitted.len()),
            mapping_count: len_u32(mappings.len()),
            mapping_offset: if mappings.is_empty() { 0 } else { len_u32(fixed) },
        };

        let start = self.nodes.len();
        push(&mut self.nodes, &header);
        self.nodes.extend_from_slice(payload);
        self.nodes.resize(start + fixed, 0);
        for m in mappings {
            let record = IdMapping {
                input_base: m.input_base,
                id_count: m.id_count,
                output_base: m.output_base,
                output_reference: m.output_reference,
                flags: m.flags,
            };
            push(&mut self.nodes, &record);
        }

        self.emitted.push(EmittedNode {
            offset,
            mapping_offset: len_u32(fixed),
            mapping_count: len_u32(mappings.len()),
        });
        offset
    }
}

fn table_header_len() -> u32 {
    len_u32(Iort::HEADER_SIZE)
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).expect("length exceeds u32")
}

fn push(buf: &mut Vec<u8>, value: &impl AsBytes) {
    buf.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdt::validate_checksum;

    #[test]
    fn finished_table_validates() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[1]);
        w.root_complex(0, &[Mapping::new(0, 0xFFFF, 0, its)]);
        let table = w.finish();

        assert!(validate_checksum(&table));
        let iort = Iort::from_bytes(&table).unwrap();
        assert_eq!(iort.node_count, 2);
        assert_eq!(iort.table_len(), table.len());
    }

    #[test]
    fn patched_reference_is_visible_to_decoder() {
        let mut w = IortWriter::new();
        let its = w.its_group(&[1]);
        let rc = w.root_complex(0, &[Mapping::new(0, 0xFF, 0, its)]);
        let smmu = w.smmu_v3(0x1000, &[Mapping::new(0, 0xFF, 0, its)]);
        w.patch_mapping_reference(rc, 0, smmu);
        let table = w.finish();

        let iort = Iort::from_bytes(&table).unwrap();
        let mapping = iort.node_at(rc).unwrap().id_mappings().unwrap().next().unwrap();
        assert_eq!({ mapping.output_reference }, smmu);
    }

    #[test]
    fn nodes_are_four_byte_aligned() {
        let mut w = IortWriter::new();
        let nc = w.named_component("\\_SB.DEV", 1, &[]);
        let its = w.its_group(&[1]);
        assert_eq!(nc % 4, 0);
        assert_eq!(its % 4, 0);
    }
}
