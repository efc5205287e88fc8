pub mod download;
pub mod erase;
pub mod info;
pub mod list;

use anyhow::Context;
use daplink::flashing::{FlashProgress, ProgressEvent};
use daplink_target::{Registry, TargetConfig};
use std::cell::RefCell;
use std::rc::Rc;

/// Options to select a board, shared between commands.
#[derive(clap::Parser, Debug)]
pub struct BoardOptions {
    /// The board id or name of the target. Defaults to the `board` of the configuration.
    #[clap(long, short)]
    pub board: Option<String>,
}

impl BoardOptions {
    pub fn resolve<'r>(
        &self,
        registry: &'r Registry,
        default: Option<&str>,
    ) -> anyhow::Result<&'r TargetConfig> {
        let board = self
            .board
            .as_deref()
            .or(default)
            .context("No board selected. Pass --board or set `board` in the configuration.")?;

        registry
            .get_target_by_board_id(board)
            .or_else(|_| registry.get_target_by_name(board))
            .with_context(|| format!("Unknown board '{board}'"))
    }
}

/// Totals of a flashing run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub sectors: usize,
    pub chip_erases: usize,
    pub pages: usize,
    pub bytes: u64,
}

/// A progress handler which logs every event and adds it to the returned summary.
pub fn progress() -> (FlashProgress, Rc<RefCell<Summary>>) {
    let summary = Rc::new(RefCell::new(Summary::default()));
    let sink = summary.clone();

    let progress = FlashProgress::new(move |event| {
        let mut summary = sink.borrow_mut();
        match event {
            ProgressEvent::SessionStarted { region } => {
                tracing::info!("Flash session started for {:#010x?}", region)
            }
            ProgressEvent::SectorErased {
                address,
                size,
                time,
            } => {
                tracing::info!("Erased sector {:#010x} ({} bytes) in {:?}", address, size, time);
                summary.sectors += 1;
            }
            ProgressEvent::PageProgrammed {
                address,
                size,
                time,
            } => {
                tracing::debug!("Programmed page {:#010x} ({} bytes) in {:?}", address, size, time);
                summary.pages += 1;
                summary.bytes += size as u64;
            }
            ProgressEvent::ChipErased { region, time } => {
                tracing::info!("Erased {:#010x?} in {:?}", region, time);
                summary.chip_erases += 1;
            }
            ProgressEvent::SessionFinished => tracing::info!("Flash session finished"),
            ProgressEvent::Failed { address } => {
                tracing::error!("Flashing failed at {:#010x}", address)
            }
        }
    });

    (progress, summary)
}
