//! `iovirt-iort` --- a standalone, `no_std` decoder for the ACPI IO Remapping
//! Table (IORT).
//!
//! The IORT describes how I/O identifiers are remapped on Arm platforms: PCI
//! root complexes and named components map requester IDs onto SMMUs, which in
//! turn map stream IDs onto ITS groups. This crate exposes the raw table as
//! offset-addressed nodes and decodes each node's type-specific payload. It
//! never trusts an offset: every node, mapping array and interrupt array is
//! checked against the table's declared length before it is read.
//!
//! Tables are obtained either through an [`AcpiHandler`] that maps physical
//! memory, or directly from a byte slice. Enable the `alloc` feature for
//! [`writer::IortWriter`], which emits well-formed tables.
//!
//! # Usage
//!
//! ```ignore
//! let iort = Iort::parse(&my_handler, iort_physical_address)?;
//! for node in iort.nodes() {
//!     let node = node?;
//!     // ...
//! }
//! ```

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

pub mod iort;
pub mod node;
pub mod sdt;
#[cfg(any(test, feature = "alloc"))]
pub mod writer;

pub use iort::{IdMapping, IdMappingIter, Iort, IortNode, NodeIter, RawNodeHeader};
pub use node::{ContextInterrupts, ItsIdentifiers, NodeBody, NodeType};
pub use sdt::{SdtHeader, ValidatedTable};

use core::fmt;

/// Errors that can occur while decoding an IORT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// The checksum of the table did not validate (sum != 0).
    InvalidChecksum,
    /// The table signature did not match the expected value.
    InvalidSignature,
    /// A table or structure was too short to contain the expected data.
    TruncatedData,
    /// A node or array referenced by offset lies outside the table.
    OutOfBounds {
        /// Byte offset, from the start of the table, that could not be used.
        offset: u32,
    },
}

impl fmt::Display for AcpiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidChecksum => write!(f, "table checksum does not sum to zero"),
            Self::InvalidSignature => write!(f, "unexpected table signature"),
            Self::TruncatedData => write!(f, "table data truncated"),
            Self::OutOfBounds { offset } => {
                write!(f, "offset {offset:#x} lies outside the table")
            }
        }
    }
}

impl core::error::Error for AcpiError {}

/// Trait for mapping physical memory regions so ACPI tables can be read.
///
/// An implementation must return a byte slice covering at least `size` bytes
/// starting at physical address `phys`. The mapping may be an identity map or
/// a temporary mapping; the crate is agnostic to the strategy.
///
/// # Safety
///
/// Implementors must ensure that the returned slice is valid and readable for
/// the requested `size` bytes. The mapping must remain valid for `'static`.
pub unsafe trait AcpiHandler {
    /// Map a physical memory region and return a byte slice over it.
    ///
    /// # Safety
    ///
    /// The caller guarantees that `phys` is a valid ACPI-related physical
    /// address and `size` does not extend beyond the actual table.
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8];
}
