//! Target description schema
//!
//! Programming the flash of a board requires some board specific configuration:
//! where the flash lives, how it is divided into erase sectors, and which flash
//! algorithm blob is copied into target RAM to do the actual erasing and programming.
//!
//! This crate contains the schema structs for the YAML board description files,
//! the sector map lookups over a board's flash regions, and the registry of the
//! boards compiled into the crate.
//!
#![warn(missing_docs)]

mod memory;
mod program_target;
pub mod registry;
pub mod sector_map;
pub(crate) mod serialize;
mod target_config;

pub use memory::{FlashRegion, MemoryRange, RamRegion, Sector, SectorInfo};
pub use program_target::{AlgorithmTimeouts, ProgramTarget, SysCallParams};
pub use registry::{Registry, RegistryError};
pub use sector_map::SectorMapError;
pub use target_config::{TargetConfig, TargetDescriptionSource, TargetValidationError};
