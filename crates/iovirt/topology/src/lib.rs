//! `iovirt-topology` --- I/O virtualization topology resolver.
//!
//! Turns an IO Remapping Table into a compact, offset-addressed graph of
//! SMMUs, PCI root complexes, named components, ITS groups and PMCGs, and
//! answers identifier translation queries against it.
//!
//! The graph is built once into a caller-owned buffer. Structurally
//! identical nodes reached through different mappings are stored once, and
//! after the build an analysis pass flags overlapping output ID ranges.
//! The built [`Topology`] is immutable and `Sync`, so any number of threads
//! can query it without locking.
//!
//! # Usage
//!
//! ```ignore
//! let iort = Iort::parse(&my_handler, iort_physical_address)?;
//! let topology = IovirtArena::new(&mut buffer).build(&iort, &BuildConfig::default())?;
//! let info = topology.device_info(rid, segment)?;
//! // ...
//! let arena = topology.release();
//! ```

#![cfg_attr(not(test), no_std)]

mod arena;
mod block;
mod builder;
pub mod config;
mod ctx_int;
pub mod error;
mod overlap;
pub mod query;
pub mod view;

pub use arena::{IovirtArena, Topology};
pub use block::{MAX_NAMED_COMPONENT_NAME, NodeFlags};
pub use config::{BuildConfig, IdRangeEnd, SmmuOverride};
pub use error::{BuildError, QueryError};
pub use iovirt_iort::NodeType;
pub use query::{DeviceInfo, NamedComponentInfo, PmcgInfo, RcInfo, SmmuInfo};
pub use view::{IdMappingEdge, NodeClass, NodeRef, NodeView};
