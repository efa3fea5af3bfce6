//! Build configuration.
//!
//! With the `serde` feature the configuration can be loaded from a platform
//! description:
//!
//! ```toml
//! id_range_end = "inclusive"
//!
//! [smmu_override]
//! base = 0x2b40_0000
//! arch_major_rev = 3
//! ```

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Options for [`IovirtArena::build`](crate::IovirtArena::build).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct BuildConfig {
    /// How the end of an ID mapping range is computed.
    pub id_range_end: IdRangeEnd,
    /// When set, the firmware table is ignored and the graph holds a single
    /// SMMU described by the override.
    pub smmu_override: Option<SmmuOverride>,
}

/// A platform-provided SMMU that replaces the firmware description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SmmuOverride {
    /// Base address of the SMMU register frame.
    pub base: u64,
    /// Architecture major revision, 2 or 3.
    pub arch_major_rev: u32,
}

/// Convention for the last identifier covered by an ID mapping.
///
/// IORT stores `id_count` as the number of IDs minus one, so a mapping covers
/// `input_base..=input_base + id_count`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum IdRangeEnd {
    /// Every range ends at `base + id_count`, in translation and overlap analysis alike.
    #[default]
    Inclusive,
    /// Overlap analysis ends ranges at `base + id_count - 1` with 32-bit wrapping,
    /// matching older compliance tooling. Translation is unaffected.
    LegacyOverlap,
}

impl IdRangeEnd {
    /// Last output ID the overlap analysis considers part of a range.
    #[must_use]
    pub const fn overlap_end(self, base: u32, id_count: u32) -> u64 {
        match self {
            Self::Inclusive => base as u64 + id_count as u64,
            Self::LegacyOverlap => base.wrapping_add(id_count).wrapping_sub(1) as u64,
        }
    }
}
