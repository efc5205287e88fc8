use daplink::flashing::{FlashSequencer, SequencerOptions, SimulatedFlash};
use daplink_target::Registry;

use super::BoardOptions;

#[derive(clap::Parser)]
pub struct Cmd {
    #[clap(flatten)]
    board: BoardOptions,

    /// Erase sector by sector even if the flash algorithm can erase the whole chip.
    #[clap(long)]
    no_chip_erase: bool,
}

impl Cmd {
    pub fn run(
        self,
        registry: &Registry,
        default_board: Option<&str>,
        mut options: SequencerOptions,
    ) -> anyhow::Result<()> {
        let target = self.board.resolve(registry, default_board)?;
        if self.no_chip_erase {
            options.chip_erase = false;
        }

        let mut flash = SimulatedFlash::for_target(target);
        let (progress, summary) = super::progress();

        let mut sequencer =
            FlashSequencer::new(target, &mut flash, options).with_progress(progress);
        sequencer.erase_all()?;
        drop(sequencer);

        let summary = *summary.borrow();
        println!(
            "Erased {} with {} chip erases and {} sector erases.",
            target.name, summary.chip_erases, summary.sectors
        );

        Ok(())
    }
}
