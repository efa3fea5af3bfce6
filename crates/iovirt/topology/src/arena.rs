//! Arena lifecycle: uninitialized, built, released.

use iovirt_iort::{Iort, NodeType};

use crate::block::{
    ArenaHeader, Block, BlockIter, ItsGroupData, NamedComponentData, PmcgData, RootComplexData,
    SmmuData,
};
use crate::builder::Builder;
use crate::config::BuildConfig;
use crate::error::BuildError;
use crate::overlap;

/// A caller-owned buffer that has not been built into a topology.
///
/// The builder never grows the buffer; size it for the platform (a few
/// kilobytes covers typical servers).
#[derive(Debug)]
pub struct IovirtArena<'a> {
    buf: &'a mut [u8],
}

impl<'a> IovirtArena<'a> {
    /// Wrap `buf` for a later build.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    /// Size of the buffer in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Build the topology described by `iort` into the arena.
    ///
    /// When `config` carries an SMMU override, the table is ignored and the
    /// topology holds just that SMMU.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] if the table is malformed, contains a node
    /// type the builder does not model, references nodes cyclically, or does
    /// not fit in the arena. The arena is consumed either way.
    pub fn build(self, iort: &Iort<'_>, config: &BuildConfig) -> Result<Topology<'a>, BuildError> {
        self.build_inner(Some(*iort), config)
    }

    /// Build a topology for a platform without an IORT.
    ///
    /// The result is empty unless `config` carries an SMMU override.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ArenaTooSmall`] or
    /// [`BuildError::ArenaExhausted`] if the arena cannot hold the result.
    pub fn build_without_table(self, config: &BuildConfig) -> Result<Topology<'a>, BuildError> {
        self.build_inner(None, config)
    }

    fn build_inner(
        self,
        iort: Option<Iort<'_>>,
        config: &BuildConfig,
    ) -> Result<Topology<'a>, BuildError> {
        let buf = self.buf;
        let result = populate(buf, iort, config);
        let header = match result {
            Ok(header) => header,
            Err(err) => {
                log::error!("iovirt: topology build failed: {err}");
                return Err(err);
            }
        };

        let used = header.used as usize;
        let blocks = header.num_blocks;
        let collisions = overlap::analyze(&mut buf[..used], blocks, config.id_range_end);
        let (smmus, rcs) = (header.num_smmus, header.num_pci_rcs);
        let (ncs, its_groups, pmcgs) = (
            header.num_named_components,
            header.num_its_groups,
            header.num_pmcgs,
        );
        log::info!("iovirt: {blocks} blocks in {used} bytes, {collisions} overlapping ranges");
        log::info!(
            "iovirt:   {smmus} SMMUs, {rcs} root complexes, {ncs} named components, \
             {its_groups} ITS groups, {pmcgs} PMCGs"
        );
        Ok(Topology { buf, header })
    }
}

fn populate(
    buf: &mut [u8],
    iort: Option<Iort<'_>>,
    config: &BuildConfig,
) -> Result<ArenaHeader, BuildError> {
    let mut builder = Builder::new(buf, iort)?;
    match &config.smmu_override {
        Some(smmu) => builder.add_override(smmu)?,
        None => builder.add_table()?,
    }
    Ok(builder.finish())
}

/// A built, immutable I/O virtualization topology.
///
/// All queries take `&self`; the topology is `Sync` and can be shared across
/// threads without locking.
#[derive(Debug)]
pub struct Topology<'a> {
    buf: &'a mut [u8],
    header: ArenaHeader,
}

impl<'a> Topology<'a> {
    /// Tear the topology down. The buffer is zeroed and handed back for reuse.
    pub fn release(self) -> IovirtArena<'a> {
        let Self { buf, .. } = self;
        buf.fill(0);
        IovirtArena { buf }
    }

    /// Bytes of the arena in use, header included.
    #[must_use]
    pub fn used(&self) -> usize {
        self.header.used as usize
    }

    /// The arena bytes in use.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.used()]
    }

    pub(crate) fn header(&self) -> &ArenaHeader {
        &self.header
    }

    pub(crate) fn blocks(&self) -> BlockIter<'_> {
        BlockIter::new(self.as_bytes(), self.header.num_blocks)
    }

    /// Log every block and its mappings at `info` level.
    pub fn dump(&self) {
        let arena = self.as_bytes();
        let blocks = self.header.num_blocks;
        log::info!("iovirt: {blocks} blocks");
        for block in self.blocks() {
            dump_block(arena, &block);
        }
    }
}

fn dump_block(arena: &[u8], block: &Block) {
    let offset = block.offset;
    match block.kind {
        NodeType::ItsGroup => {
            let count = block
                .payload::<ItsGroupData>(arena)
                .map_or(0, |its| its.its_count);
            log::info!("  [{offset:#x}] ITS group, {count} ITS");
            for index in 0..count {
                if let Some(id) = block.its_id(arena, index) {
                    log::info!("    ITS ID {id}");
                }
            }
            return;
        }
        NodeType::NamedComponent => {
            if let Some(nc) = block.payload::<NamedComponentData>(arena) {
                let name = nc.name;
                let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                let name = core::str::from_utf8(&name[..len]).unwrap_or("<invalid>");
                let cca = nc.cca;
                log::info!("  [{offset:#x}] named component {name}, CCA {cca:#x}");
            }
        }
        NodeType::RootComplex => {
            if let Some(rc) = block.payload::<RootComplexData>(arena) {
                let segment = rc.segment;
                log::info!("  [{offset:#x}] root complex, segment {segment}");
            }
        }
        NodeType::SmmuV1V2 | NodeType::SmmuV3 => {
            if let Some(smmu) = block.payload::<SmmuData>(arena) {
                let (rev, base) = (smmu.arch_major_rev, smmu.base);
                log::info!("  [{offset:#x}] SMMUv{rev} at {base:#x}");
            }
        }
        NodeType::Pmcg => {
            if let Some(pmcg) = block.payload::<PmcgData>(arena) {
                let (base, gsiv, node_ref) = (pmcg.base, pmcg.overflow_gsiv, pmcg.node_ref);
                log::info!(
                    "  [{offset:#x}] PMCG at {base:#x}, overflow GSIV {gsiv:#x}, node {node_ref:#x}"
                );
            }
        }
    }
    log::info!("    {} ID mappings", block.num_maps());
    for index in 0..block.num_maps() {
        if let Some(map) = block.map(arena, index) {
            let (input, count, output, target) =
                (map.input_base, map.id_count, map.output_base, map.output_ref);
            log::info!("    {input:#x}+{count:#x} -> {output:#x} in {target:#x}");
        }
    }
}
