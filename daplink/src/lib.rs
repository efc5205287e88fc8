//! # In-target flash programming for DAPLink class debug adapters
//!
//! A host hands firmware to the adapter in arbitrary chunks. This crate turns those chunks
//! into erase and program calls of a flash algorithm, which is a small position
//! independent blob executed on the target core itself.
//!
//! - [`flashing::FlashSequencer`] splits data along the sector map of a target and opens
//!   one `Init`..`UnInit` session per flash region.
//! - [`flashing::BlobRunner`] runs the routines of a flash algorithm blob through a
//!   [`executor::TargetExecutor`].
//! - [`flashing::SimulatedFlash`] keeps the flash in memory, for dry runs and tests.
//! - [`lock::DapLock`] serializes access to the debug port.
//!
//! Target descriptions live in the [`daplink_target`] crate.
//!
//! ## Programming a target
//!
//! ```no_run
//! use daplink::executor::TargetExecutor;
//! use daplink::flashing::{BlobRunner, FlashSequencer, SequencerOptions};
//! use daplink_target::Registry;
//!
//! fn flash(executor: impl TargetExecutor, firmware: &[u8]) -> anyhow::Result<()> {
//!     let registry = Registry::from_builtin_boards();
//!     let target = registry.get_target_by_board_id("0826")?;
//!
//!     let mut sequencer =
//!         FlashSequencer::new(target, BlobRunner::new(executor), SequencerOptions::default());
//!     sequencer.download(0x0800_0000, firmware)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod executor;
pub mod flashing;
pub mod lock;

pub use crate::executor::{CoreRegister, CoreStatus, ExecutorError, TargetExecutor};
pub use crate::flashing::{FlashError, ProgramError};
pub use crate::lock::{DapLock, DapLockGuard};
