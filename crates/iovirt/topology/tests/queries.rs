mod common;

use common::{ARENA_SIZE, ITS_IDS, SMMU_BASE, build, two_hop_table};
use iovirt_iort::writer::{IortWriter, Mapping};
use iovirt_topology::{
    DeviceInfo, MAX_NAMED_COMPONENT_NAME, NamedComponentInfo, NodeClass, NodeType, PmcgInfo,
    QueryError, RcInfo, SmmuInfo,
};
use test_case::test_case;

#[test_case(0x100, 0x1_0000, 0x2_0000; "low end")]
#[test_case(0x8000, 0x1_7F00, 0x2_7F00; "middle")]
#[test_case(0xFFFF, 0x1_FEFF, 0x2_FEFF; "high end")]
fn two_hop_translation(rid: u32, stream_id: u32, device_id: u32) {
    let table = two_hop_table();
    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);

    assert_eq!(
        topology.device_info(rid, 0),
        Ok(DeviceInfo {
            device_id,
            stream_id: Some(stream_id),
            its_id: Some(ITS_IDS[0]),
        })
    );
}

#[test]
fn rid_below_range_has_no_mapping() {
    let table = two_hop_table();
    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);

    assert_eq!(topology.device_info(0xFF, 0), Err(QueryError::NoMapping));
    assert_eq!(topology.device_info(0x100, 1), Err(QueryError::NoMapping));
    assert_eq!(topology.rc_smmu_base(0, 0xFF), Err(QueryError::NoMapping));
}

#[test]
fn direct_its_mapping_has_no_stream_id() {
    let mut w = IortWriter::new();
    let its = w.its_group(&[0x21, 0x22]);
    w.root_complex(2, &[Mapping::new(0, 0xFFFF, 0x4_0000, its)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(
        topology.device_info(0x10, 2),
        Ok(DeviceInfo {
            device_id: 0x4_0010,
            stream_id: None,
            its_id: Some(0x21),
        })
    );
    assert_eq!(topology.rc_smmu_base(2, 0x10), Ok(None));
    assert_eq!(topology.rc_smmu_index(2, 0x10), Err(QueryError::NotBehindIommu));
    assert_eq!(
        topology.pcie_rc_info(0, RcInfo::SmmuBase),
        Err(QueryError::NotBehindIommu)
    );
}

#[test]
fn stream_id_outside_smmu_ranges_has_no_mapping() {
    let mut w = IortWriter::new();
    let its = w.its_group(&[1]);
    let smmu = w.smmu_v3(SMMU_BASE, &[Mapping::new(0, 0xFF, 0, its)]);
    w.root_complex(0, &[Mapping::new(0, 0xFFFF, 0x1000, smmu)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.device_info(0, 0), Err(QueryError::NoMapping));
    // The root complex still maps onto the SMMU, but the SMMU drops the stream.
    assert_eq!(topology.rc_smmu_base(0, 0), Ok(None));
    assert_eq!(topology.pcie_rc_info(0, RcInfo::SmmuBase), Ok(SMMU_BASE));
}

#[test]
fn hop_onto_named_component_is_unsupported() {
    let mut w = IortWriter::new();
    let nc = w.named_component("\\_SB.DEV0", 1, &[]);
    w.root_complex(0, &[Mapping::new(0, 0xFF, 0, nc)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(
        topology.device_info(1, 0),
        Err(QueryError::UnsupportedHop {
            kind: NodeType::NamedComponent
        })
    );
}

#[test]
fn smmu_chained_to_smmu_is_unsupported() {
    let mut w = IortWriter::new();
    let its = w.its_group(&[1]);
    let inner = w.smmu_v3(0x3000_0000, &[Mapping::new(0, 0xFFFF, 0, its)]);
    let outer = w.smmu_v3(0x4000_0000, &[Mapping::new(0, 0xFFFF, 0, inner)]);
    w.root_complex(0, &[Mapping::new(0, 0xFFFF, 0, outer)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(
        topology.device_info(7, 0),
        Err(QueryError::UnsupportedHop {
            kind: NodeType::SmmuV3
        })
    );
}

#[test]
fn root_complex_fields_and_smmu_lookup() {
    let mut w = IortWriter::new();
    let its = w.its_group(&[1]);
    let smmu0 = w.smmu_v3(0x1000_0000, &[Mapping::new(0, 0xFFFF, 0, its)]);
    let smmu1 = w.smmu_v3(0x2000_0000, &[Mapping::new(0, 0xFFFF, 0x1_0000, its)]);
    w.root_complex_with(0, 1, 0, &[Mapping::new(0, 0xFFFF, 0, smmu0)]);
    w.root_complex_with(5, 0, 1, &[Mapping::new(0, 0xFFFF, 0, smmu1)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.pcie_rc_info(1, RcInfo::Segment), Ok(5));
    assert_eq!(topology.pcie_rc_info(1, RcInfo::MemAttribute), Ok(0));
    assert_eq!(topology.pcie_rc_info(1, RcInfo::AtsAttribute), Ok(1));
    assert_eq!(topology.pcie_rc_info(0, RcInfo::MemAttribute), Ok(1));
    assert_eq!(topology.pcie_rc_info(1, RcInfo::SmmuBase), Ok(0x2000_0000));

    assert_eq!(topology.rc_index(5), Ok(1));
    assert_eq!(topology.rc_index(6), Err(QueryError::NotFound));
    assert_eq!(topology.rc_smmu_base(5, 0x42), Ok(Some(0x2000_0000)));
    assert_eq!(topology.rc_smmu_index(5, 0x42), Ok(1));
    assert_eq!(topology.rc_smmu_index(0, 0x42), Ok(0));

    let node = topology.pcie_rc_info(1, RcInfo::Node).unwrap();
    let view = topology.nth(NodeClass::RootComplex, 1).unwrap();
    assert_eq!(node, u64::from(view.node_ref().offset()));
    assert_eq!(
        topology.pcie_rc_info(2, RcInfo::Segment),
        Err(QueryError::IndexOutOfRange { index: 2, count: 2 })
    );
}

#[test]
fn last_covering_root_complex_on_a_segment_wins() {
    let mut w = IortWriter::new();
    let its = w.its_group(&[0x31, 0x32]);
    let smmu_a = w.smmu_v3(0x1000_0000, &[Mapping::new(0, 0xFFFF, 0x1_0000, its)]);
    let smmu_b = w.smmu_v3(0x2000_0000, &[Mapping::new(0, 0xFFFF, 0x2_0000, its)]);
    // Same segment, told apart by their memory and ATS attributes.
    w.root_complex_with(3, 1, 0, &[Mapping::new(0, 0xFF, 0, smmu_a)]);
    w.root_complex_with(3, 0, 1, &[Mapping::new(0, 0xFF, 0, smmu_b)]);
    w.root_complex_with(3, 1, 1, &[Mapping::new(0x1000, 0xFF, 0, smmu_a)]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.count(NodeClass::RootComplex), 3);
    assert_eq!(
        topology.device_info(0x10, 3),
        Ok(DeviceInfo {
            device_id: 0x2_0010,
            stream_id: Some(0x10),
            its_id: Some(0x31),
        })
    );
    assert_eq!(topology.rc_smmu_base(3, 0x10), Ok(Some(0x2000_0000)));
    assert_eq!(topology.rc_smmu_index(3, 0x10), Ok(1));

    // Only the third root complex covers this RID.
    assert_eq!(
        topology.device_info(0x1010, 3).map(|info| info.device_id),
        Ok(0x1_0010)
    );
    assert_eq!(topology.rc_smmu_base(3, 0x1010), Ok(Some(0x1000_0000)));
}

#[test]
fn smmu_fields() {
    let mut w = IortWriter::new();
    w.smmu_v2(0x5000_0000, &[], &[]);
    w.smmu_v3(0x6000_0000, &[]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.smmu_info(0, SmmuInfo::ArchMajorRev), Ok(2));
    assert_eq!(topology.smmu_info(1, SmmuInfo::ArchMajorRev), Ok(3));
    assert_eq!(topology.smmu_info(1, SmmuInfo::Base), Ok(0x6000_0000));
    assert_eq!(
        topology.nth(NodeClass::Smmu, 0).unwrap().kind(),
        NodeType::SmmuV1V2
    );
}

#[test]
fn named_component_fields() {
    let long_name = format!("\\_SB.{}", "X".repeat(200));
    let mut w = IortWriter::new();
    let its = w.its_group(&[1]);
    let smmu = w.smmu_v3(SMMU_BASE, &[Mapping::new(0, 0xFFFF, 0, its)]);
    w.named_component("\\_SB.ETR0", 1, &[Mapping::new(0, 0, 0x40, smmu)]);
    w.named_component(&long_name, 0, &[]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.named_component_name(0), Ok(&b"\\_SB.ETR0"[..]));
    assert_eq!(
        topology.named_component_info(0, NamedComponentInfo::CcaAttribute),
        Ok(1)
    );
    assert_eq!(
        topology.named_component_info(0, NamedComponentInfo::SmmuBase),
        Ok(SMMU_BASE)
    );

    let truncated = topology.named_component_name(1).unwrap();
    assert_eq!(truncated.len(), MAX_NAMED_COMPONENT_NAME - 1);
    assert!(long_name.as_bytes().starts_with(truncated));
    assert_eq!(
        topology.named_component_info(1, NamedComponentInfo::SmmuBase),
        Err(QueryError::NotBehindIommu)
    );
}

#[test]
fn pmcg_fields() {
    let mut w = IortWriter::new();
    let rc = w.root_complex(0, &[]);
    let smmu = w.smmu_v3(SMMU_BASE, &[]);
    w.pmcg(0x2b42_0000, 0x61, smmu);
    w.pmcg(0x2b44_0000, 0x62, rc);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.count(NodeClass::Pmcg), 2);
    assert_eq!(topology.pmcg_info(0, PmcgInfo::Base), Ok(0x2b42_0000));
    assert_eq!(topology.pmcg_info(0, PmcgInfo::OverflowGsiv), Ok(0x61));
    assert_eq!(topology.pmcg_info(0, PmcgInfo::NodeSmmuBase), Ok(SMMU_BASE));
    let smmu_node = topology.smmu_info(0, SmmuInfo::Node).unwrap();
    assert_eq!(topology.pmcg_info(0, PmcgInfo::NodeRef), Ok(smmu_node));

    let rc_node = topology.pcie_rc_info(0, RcInfo::Node).unwrap();
    assert_eq!(topology.pmcg_info(1, PmcgInfo::NodeRef), Ok(rc_node));
    assert_eq!(
        topology.pmcg_info(1, PmcgInfo::NodeSmmuBase),
        Err(QueryError::NotBehindIommu)
    );
}

#[test]
fn its_group_lookups() {
    let mut w = IortWriter::new();
    w.its_group(&[1, 2, 3]);
    w.its_group(&[4, 5]);
    let table = w.finish();

    let mut buf = [0u8; ARENA_SIZE];
    let topology = build(&table, &mut buf);
    assert_eq!(topology.count(NodeClass::ItsGroup), 2);
    assert_eq!(topology.its_group_size(0), Ok(3));
    assert_eq!(topology.its_group_size(1), Ok(2));
    assert_eq!(topology.its_id(0, 2), Ok(3));
    assert_eq!(
        topology.its_id(0, 3),
        Err(QueryError::IndexOutOfRange { index: 3, count: 3 })
    );
    assert_eq!(topology.its_block_index(1, 5), Ok(1));
    assert_eq!(topology.its_block_index(1, 1), Err(QueryError::NotFound));
    assert_eq!(topology.its_group_index(5), Ok(1));
    assert_eq!(topology.its_group_index(9), Err(QueryError::NotFound));

    let ids: Vec<u32> = topology.nth(NodeClass::ItsGroup, 0).unwrap().its_ids().collect();
    assert_eq!(ids, [1, 2, 3]);
}
