//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use iovirt_iort::Iort;
use iovirt_iort::writer::{IortWriter, Mapping};
use iovirt_topology::{BuildConfig, IovirtArena, Topology};

pub const ARENA_SIZE: usize = 4096;

pub const SMMU_BASE: u64 = 0x2b40_0000;
pub const ITS_IDS: [u32; 2] = [0x11, 0x12];

/// Build `table` into `buf` with the default configuration.
pub fn build<'a>(table: &[u8], buf: &'a mut [u8]) -> Topology<'a> {
    build_with(table, buf, &BuildConfig::default())
}

pub fn build_with<'a>(table: &[u8], buf: &'a mut [u8], config: &BuildConfig) -> Topology<'a> {
    let iort = Iort::from_bytes(table).expect("fixture table is valid");
    IovirtArena::new(buf)
        .build(&iort, config)
        .expect("fixture table builds")
}

/// Root complex (segment 0) -> SMMUv3 -> ITS group.
///
/// The root complex maps RIDs `0x100..=0xFFFF` onto stream IDs starting at
/// `0x1_0000`; the SMMU maps stream IDs `0x1_0000..=0x1_FFFF` onto device IDs
/// starting at `0x2_0000`.
pub fn two_hop_table() -> Vec<u8> {
    let mut w = IortWriter::new();
    let its = w.its_group(&ITS_IDS);
    let smmu = w.smmu_v3(SMMU_BASE, &[Mapping::new(0x1_0000, 0xFFFF, 0x2_0000, its)]);
    w.root_complex(0, &[Mapping::new(0x100, 0xFEFF, 0x1_0000, smmu)]);
    w.finish()
}
