//! Flash programming operations.
//!
//! This module drives flash algorithms to erase and program the flash of a target.
//!
//! It provides a convenient high level interface that can flash an IHEX or BIN file
//! as well as a lower level block based interface through the [`FlashSequencer`].
//!
//! ## Examples
//!
//! ### Programming data into simulated flash
//!
//! ```
//! use daplink::flashing::{FlashSequencer, SequencerOptions, SimulatedFlash};
//! use daplink_target::Registry;
//!
//! let registry = Registry::from_builtin_boards();
//! let target = registry.get_target_by_board_id("1102")?;
//!
//! let mut flash = SimulatedFlash::for_target(target);
//! let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());
//!
//! sequencer.program(0x1000, &[0x1, 0x2, 0x3, 0x4])?;
//! sequencer.finish()?;
//! drop(sequencer);
//!
//! assert_eq!(flash.contents(0x1000, 4), vec![0x1, 0x2, 0x3, 0x4]);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod download;
mod erase;
mod error;
mod flash_algorithm;
mod flasher;
mod progress;
mod sequencer;
mod simulated;

pub use download::*;
pub use error::*;
pub use flash_algorithm::*;
pub use flasher::*;
pub use progress::*;
pub use sequencer::{AbortHandle, FlashSequencer, SequencerOptions};
pub use simulated::*;
