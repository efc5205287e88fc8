use super::{FlashAlgorithm, FlashError, FlashFunction, FlashSequencer};
use daplink_target::FlashRegion;
use std::time::Instant;

impl<'t, A: FlashAlgorithm> FlashSequencer<'t, A> {
    /// Erase the flash of the whole target.
    ///
    /// Every region which is not an alias is erased in its own `Init(Erase)`..`UnInit`
    /// bracket. Algorithms with an `EraseChip` routine erase all their regions with one call,
    /// unless chip erase is disabled in the options; all others erase sector by sector.
    ///
    /// An open programming session is closed first, dropping its pending page. Afterwards
    /// the target is released like at the end of programming.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Erasing all...");

        self.close_session()?;

        let target = self.target;
        let mut chip_erased: Vec<&str> = vec![];

        for region in &target.flash_regions {
            if region.is_alias {
                tracing::debug!("Skipping alias memory region {:#010x?}", region.range());
                continue;
            }
            if chip_erased.contains(&region.algorithm.as_str()) {
                tracing::debug!(
                    "Region {:#010x?} was erased by the chip erase of {}",
                    region.range(),
                    region.algorithm
                );
                continue;
            }

            if let Err(error) = self.erase_region(region, &mut chip_erased) {
                if let Err(teardown) = self.close_session() {
                    tracing::warn!("Failed to uninitialize the flash algorithm: {}", teardown);
                }
                self.progress.failed(region.start);
                return Err(error);
            }
        }

        self.algorithm.finish(self.options.auto_reset)
    }

    fn erase_region(
        &mut self,
        region: &'t FlashRegion,
        chip_erased: &mut Vec<&'t str>,
    ) -> Result<(), FlashError> {
        self.open_session(region, FlashFunction::Erase)?;

        if self.options.chip_erase && self.algorithm.supports_erase_chip() {
            tracing::debug!("     -- chip erase supported, doing it.");

            let t1 = Instant::now();
            self.algorithm.erase_chip()?;
            chip_erased.push(&region.algorithm);
            self.progress.chip_erased(region.range(), t1.elapsed());

            if self.target.erase_reset {
                tracing::debug!("Reloading the flash algorithm after chip erase.");
                self.close_session()?;
                self.algorithm.unload();
                self.open_session(region, FlashFunction::Erase)?;
            }
        } else {
            tracing::debug!("     -- chip erase not supported, erasing by sector.");

            for sector in region.sectors() {
                if self.abort.is_aborted() {
                    return Err(FlashError::Aborted);
                }

                tracing::debug!(
                    "    sector: {:#010x}-{:#010x} ({} bytes)",
                    sector.start,
                    sector.end(),
                    sector.size
                );

                let t1 = Instant::now();
                self.algorithm.erase_sector(sector.start)?;
                self.progress
                    .sector_erased(sector.start, sector.size, t1.elapsed());
            }
        }

        self.close_session()
    }
}
