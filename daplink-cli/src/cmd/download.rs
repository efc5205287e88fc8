use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use daplink::flashing::{
    download_file, BinOptions, FlashSequencer, Format, SequencerOptions, SimulatedFlash,
};
use daplink_target::Registry;

use super::BoardOptions;
use crate::util::parse_u32;

#[derive(clap::Parser)]
pub struct Cmd {
    #[clap(flatten)]
    board: BoardOptions,

    /// The path to the file to be downloaded to the flash.
    path: PathBuf,

    /// The format of the file, `bin` or `hex`. Guessed from the file extension if omitted.
    #[clap(long)]
    format: Option<String>,

    /// The address in flash where a binary file will be put at.
    #[clap(long, value_parser = parse_u32)]
    base_address: Option<u32>,

    /// The number of bytes to skip at the start of a binary file.
    #[clap(long, value_parser = parse_u32, default_value = "0")]
    skip: u32,

    /// Read back every page after programming it.
    #[clap(long)]
    verify: bool,

    /// Write the resulting contents of the default flash region to this file.
    #[clap(long)]
    dump: Option<PathBuf>,
}

impl Cmd {
    fn format(&self) -> anyhow::Result<Format> {
        let format = match &self.format {
            Some(format) => Format::from_str(format).map_err(anyhow::Error::msg)?,
            None => match self.path.extension().and_then(|e| e.to_str()) {
                Some(extension) if Format::from_str(extension) == Ok(Format::Hex) => Format::Hex,
                _ => Format::Bin(BinOptions::default()),
            },
        };

        Ok(match format {
            Format::Bin(_) => Format::Bin(BinOptions {
                base_address: self.base_address,
                skip: self.skip,
            }),
            Format::Hex => Format::Hex,
        })
    }

    pub fn run(
        self,
        registry: &Registry,
        default_board: Option<&str>,
        mut options: SequencerOptions,
    ) -> anyhow::Result<()> {
        let target = self.board.resolve(registry, default_board)?;
        let format = self.format()?;
        options.verify |= self.verify;

        let mut flash = SimulatedFlash::for_target(target);
        let (progress, summary) = super::progress();

        let mut sequencer =
            FlashSequencer::new(target, &mut flash, options).with_progress(progress);
        download_file(&mut sequencer, &self.path, format)
            .with_context(|| format!("Failed to download {}", self.path.display()))?;
        drop(sequencer);

        let summary = *summary.borrow();
        println!(
            "Programmed {} bytes in {} pages to {}, erasing {} sectors.",
            summary.bytes, summary.pages, target.name, summary.sectors
        );

        if let Some(dump) = &self.dump {
            let region = target
                .default_region()
                .or_else(|| target.flash_regions.first())
                .context("The target has no flash regions.")?;
            let contents = flash.contents(region.start, region.size() as usize);
            std::fs::write(dump, contents)
                .with_context(|| format!("Failed to write {}", dump.display()))?;
            println!("Wrote the flash image of {:#010x?} to {}", region.range(), dump.display());
        }

        Ok(())
    }
}
