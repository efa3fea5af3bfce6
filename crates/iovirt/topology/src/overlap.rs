//! Output ID range collision analysis.
//!
//! Every outgoing mapping is compared with every later mapping (in the same
//! block or a later one) that targets the same block. Colliding output ranges
//! raise [`NodeFlags::DEVICE_ID_OVERLAP`] on both source blocks when the
//! shared target is an ITS group, [`NodeFlags::STREAM_ID_OVERLAP`] otherwise.

use iovirt_binparse::{AsBytes, FromBytes};
use iovirt_iort::NodeType;

use crate::block::{ArenaHeader, Block, MapSlot, NodeFlags};
use crate::config::IdRangeEnd;

/// Offset of the flags word within a block header.
const FLAGS_AT: usize = 8;

/// Flag colliding mappings in a built arena. Returns the number of
/// colliding pairs.
pub(crate) fn analyze(arena: &mut [u8], num_blocks: u32, range_end: IdRangeEnd) -> usize {
    let mut collisions = 0;
    let mut key_offset = ArenaHeader::SIZE;

    for key_index in 0..num_blocks {
        let Some(key) = block_at(arena, key_offset) else {
            break;
        };
        key_offset = key.end();
        if key.kind == NodeType::ItsGroup {
            continue;
        }

        for key_map_index in 0..key.num_maps() {
            let Some(key_map) = key.map(arena, key_map_index) else {
                continue;
            };

            let mut offset = key.offset as usize;
            for _ in key_index..num_blocks {
                let Some(block) = block_at(arena, offset) else {
                    break;
                };
                offset = block.end();
                if block.kind == NodeType::ItsGroup {
                    continue;
                }

                let first = if block.offset == key.offset {
                    key_map_index + 1
                } else {
                    0
                };
                for map_index in first..block.num_maps() {
                    let Some(map) = block.map(arena, map_index) else {
                        continue;
                    };
                    if map.output_ref != key_map.output_ref
                        || !ranges_collide(&key_map, &map, range_end)
                    {
                        continue;
                    }

                    let flag = match block_at(arena, map.output_ref as usize) {
                        Some(target) if target.kind == NodeType::ItsGroup => {
                            NodeFlags::DEVICE_ID_OVERLAP
                        }
                        _ => NodeFlags::STREAM_ID_OVERLAP,
                    };
                    let what = if flag == NodeFlags::DEVICE_ID_OVERLAP {
                        "device"
                    } else {
                        "stream"
                    };
                    let (a_base, a_count) = (key_map.output_base, key_map.id_count);
                    let (b_base, b_count) = (map.output_base, map.id_count);
                    let (a_block, b_block) = (key.offset, block.offset);
                    log::warn!(
                        "iovirt: overlapping {what} IDs {a_base:#x}+{a_count:#x} \
                         (block {a_block:#x}) and {b_base:#x}+{b_count:#x} (block {b_block:#x})"
                    );
                    raise(arena, key.offset, flag);
                    raise(arena, block.offset, flag);
                    collisions += 1;
                }
            }
        }
    }
    collisions
}

/// Returns `true` if the output ranges of `key` and `other` share an ID.
fn ranges_collide(key: &MapSlot, other: &MapSlot, range_end: IdRangeEnd) -> bool {
    let key_start = u64::from(key.output_base);
    let key_end = range_end.overlap_end(key.output_base, key.id_count);
    let start = u64::from(other.output_base);
    let end = range_end.overlap_end(other.output_base, other.id_count);

    (key_start >= start && key_start <= end)
        || (key_end >= start && key_end <= end)
        || (key_start < start && key_end > end)
}

fn block_at(arena: &[u8], offset: usize) -> Option<Block> {
    Block::at(arena, u32::try_from(offset).ok()?)
}

fn raise(arena: &mut [u8], block: u32, flag: NodeFlags) {
    let at = block as usize + FLAGS_AT;
    if let Some(flags) = u32::read_at(arena, at) {
        let _ = (flags | flag.bits()).write_at(arena, at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn slot(output_base: u32, id_count: u32) -> MapSlot {
        MapSlot {
            input_base: 0,
            id_count,
            output_base,
            output_ref: 64,
        }
    }

    #[test_case(0, 0xFF, 0x100, 0xFF, false; "adjacent")]
    #[test_case(0, 0xFF, 0x80, 0xFF, true; "partial")]
    #[test_case(0x10, 0x4, 0, 0xFF, true; "contained")]
    #[test_case(0, 0xFF, 0x10, 0x4, true; "containing")]
    #[test_case(0, 0x100, 0x100, 0xFF, true; "touching at inclusive end")]
    fn inclusive(a_base: u32, a_count: u32, b_base: u32, b_count: u32, collide: bool) {
        let (a, b) = (slot(a_base, a_count), slot(b_base, b_count));
        assert_eq!(ranges_collide(&a, &b, IdRangeEnd::Inclusive), collide);
        assert_eq!(ranges_collide(&b, &a, IdRangeEnd::Inclusive), collide);
    }

    #[test]
    fn legacy_end_is_one_shorter() {
        let (a, b) = (slot(0, 0x100), slot(0x100, 0xFF));
        assert!(ranges_collide(&a, &b, IdRangeEnd::Inclusive));
        assert!(!ranges_collide(&a, &b, IdRangeEnd::LegacyOverlap));
    }
}
