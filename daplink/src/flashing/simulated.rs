//! An in-memory stand-in for the flash of a target.

use super::flash_algorithm::compare_read_back;
use super::{FlashAlgorithm, FlashError, FlashFunction, Routine};
use crate::executor::CoreStatus;
use daplink_target::{FlashRegion, ProgramTarget, TargetConfig};
use std::collections::BTreeMap;
use std::ops::Range;

/// Sparse byte addressable memory. Bytes which were never written read as the fill value.
#[derive(Debug, Clone)]
pub struct SparseMemory {
    bytes: BTreeMap<u32, u8>,
    fill: u8,
}

impl SparseMemory {
    /// Empty memory reading as `fill` everywhere.
    pub fn new(fill: u8) -> Self {
        Self {
            bytes: BTreeMap::new(),
            fill,
        }
    }

    /// The value of the byte at `address`.
    pub fn read_byte(&self, address: u32) -> u8 {
        self.bytes.get(&address).copied().unwrap_or(self.fill)
    }

    /// Fill `data` from `address` on.
    pub fn read(&self, address: u32, data: &mut [u8]) {
        for (offset, byte) in data.iter_mut().enumerate() {
            *byte = self.read_byte(address.wrapping_add(offset as u32));
        }
    }

    /// Overwrite memory at `address` with `data`.
    pub fn write(&mut self, address: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.bytes.insert(address.wrapping_add(offset as u32), *byte);
        }
    }

    /// Writes like NOR flash does: bits can only be cleared.
    pub fn program(&mut self, address: u32, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            let address = address.wrapping_add(offset as u32);
            let current = self.read_byte(address);
            self.bytes.insert(address, current & byte);
        }
    }

    /// Resets `range` to the fill value.
    pub fn erase(&mut self, range: Range<u32>) {
        let mut tail = self.bytes.split_off(&range.start);
        let mut rest = tail.split_off(&range.end);
        self.bytes.append(&mut rest);
    }
}

/// How an injected failure ends a routine call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    /// The routine returns the given non zero code.
    Code(u32),
    /// The routine never returns.
    Timeout,
    /// The core locks up.
    LockedUp,
    /// The routine reports success without touching the flash.
    Skip,
}

/// Number of calls of each [`FlashAlgorithm`] method.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CallCounters {
    /// Blob loads. Loading the already loaded algorithm does not count.
    pub load: usize,
    /// `Init` calls.
    pub init: usize,
    /// `UnInit` calls.
    pub uninit: usize,
    /// `EraseChip` calls.
    pub erase_chip: usize,
    /// `EraseSector` calls.
    pub erase_sector: usize,
    /// `ProgramPage` calls.
    pub program_page: usize,
    /// `Verify` calls.
    pub verify: usize,
    /// Read backs.
    pub read: usize,
    /// Releases of the target.
    pub finish: usize,
}

impl CallCounters {
    fn get(&self, routine: Routine) -> usize {
        match routine {
            Routine::Init => self.init,
            Routine::UnInit => self.uninit,
            Routine::EraseChip => self.erase_chip,
            Routine::EraseSector => self.erase_sector,
            Routine::ProgramPage => self.program_page,
            Routine::Verify => self.verify,
        }
    }
}

/// A [`FlashAlgorithm`] which keeps the flash contents in memory.
///
/// Every call is checked the way a [`BlobRunner`](super::BlobRunner) checks it and logged,
/// so tests can inspect the exact sequence of routines. Failures can be scripted per
/// routine with [`SimulatedFlash::inject_failure`].
#[derive(Debug)]
pub struct SimulatedFlash {
    memory: SparseMemory,
    regions: Vec<FlashRegion>,
    loaded: Option<(ProgramTarget, FlashRegion)>,
    initialized: Option<FlashFunction>,
    counters: CallCounters,
    erased_sectors: Vec<u32>,
    programmed_pages: Vec<(u32, usize)>,
    init_calls: Vec<(u32, FlashFunction)>,
    uninit_calls: Vec<FlashFunction>,
    last_finish: Option<bool>,
    failures: Vec<(Routine, usize, InjectedFailure)>,
}

impl Default for SimulatedFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFlash {
    /// Blank flash erasing to `0xff`, without knowledge of any target.
    pub fn new() -> Self {
        Self {
            memory: SparseMemory::new(0xff),
            regions: Vec::new(),
            loaded: None,
            initialized: None,
            counters: CallCounters::default(),
            erased_sectors: Vec::new(),
            programmed_pages: Vec::new(),
            init_calls: Vec::new(),
            uninit_calls: Vec::new(),
            last_finish: None,
            failures: Vec::new(),
        }
    }

    /// Blank flash of `target`.
    pub fn for_target(target: &TargetConfig) -> Self {
        let fill = target
            .algorithms
            .first()
            .map_or(0xff, |algorithm| algorithm.erased_byte_value);

        Self {
            memory: SparseMemory::new(fill),
            regions: target.flash_regions.clone(),
            ..Self::new()
        }
    }

    /// Make the `nth` call of `routine` fail, counting from one over the whole lifetime.
    pub fn inject_failure(&mut self, routine: Routine, nth: usize, failure: InjectedFailure) {
        self.failures.push((routine, nth, failure));
    }

    /// The current flash contents.
    pub fn contents(&self, address: u32, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.memory.read(address, &mut data);
        data
    }

    /// Overwrite the flash contents, bypassing the algorithm.
    pub fn write_contents(&mut self, address: u32, data: &[u8]) {
        self.memory.write(address, data);
    }

    /// The flash contents.
    pub fn memory(&self) -> &SparseMemory {
        &self.memory
    }

    /// The number of calls of each routine.
    pub fn counters(&self) -> CallCounters {
        self.counters
    }

    /// The start of every erased sector, in call order.
    pub fn erased_sectors(&self) -> &[u32] {
        &self.erased_sectors
    }

    /// Address and length of every programmed page, in call order.
    pub fn programmed_pages(&self) -> &[(u32, usize)] {
        &self.programmed_pages
    }

    /// The arguments of every `Init` call.
    pub fn init_calls(&self) -> &[(u32, FlashFunction)] {
        &self.init_calls
    }

    /// The arguments of every `UnInit` call.
    pub fn uninit_calls(&self) -> &[FlashFunction] {
        &self.uninit_calls
    }

    /// The `auto_reset` argument of the last release of the target.
    pub fn last_finish(&self) -> Option<bool> {
        self.last_finish
    }

    /// Returns `true` between `Init` and `UnInit`.
    pub fn is_initialized(&self) -> bool {
        self.initialized.is_some()
    }

    fn loaded(&self) -> Result<&(ProgramTarget, FlashRegion), FlashError> {
        self.loaded.as_ref().ok_or(FlashError::NoAlgorithmLoaded)
    }

    /// Count a call of `routine` and decide whether it takes effect.
    ///
    /// Returns `Ok(false)` if the call reports success without effect.
    fn call(&mut self, routine: Routine) -> Result<bool, FlashError> {
        let counter = match routine {
            Routine::Init => &mut self.counters.init,
            Routine::UnInit => &mut self.counters.uninit,
            Routine::EraseChip => &mut self.counters.erase_chip,
            Routine::EraseSector => &mut self.counters.erase_sector,
            Routine::ProgramPage => &mut self.counters.program_page,
            Routine::Verify => &mut self.counters.verify,
        };
        *counter += 1;
        let nth = self.counters.get(routine);

        let failure = self
            .failures
            .iter()
            .find(|(r, n, _)| *r == routine && *n == nth)
            .map(|(_, _, failure)| *failure);

        let Some(failure) = failure else {
            return Ok(true);
        };
        tracing::debug!("Injecting {:?} into call {} of {}", failure, nth, routine);

        match failure {
            InjectedFailure::Code(code) => {
                Err(FlashError::AlgorithmReportedFailure { routine, code })
            }
            InjectedFailure::Timeout => {
                let (algorithm, _) = self.loaded()?;
                let timeout = match routine {
                    Routine::Init => algorithm.timeouts.init(),
                    Routine::UnInit => algorithm.timeouts.uninit(),
                    Routine::EraseChip => algorithm.timeouts.erase_chip(),
                    Routine::EraseSector => algorithm.timeouts.erase_sector(),
                    Routine::ProgramPage | Routine::Verify => algorithm.timeouts.program_page(),
                };
                Err(FlashError::OperationTimedOut { routine, timeout })
            }
            InjectedFailure::LockedUp => Err(FlashError::UnexpectedCoreStatus {
                routine,
                status: CoreStatus::LockedUp,
            }),
            InjectedFailure::Skip => Ok(false),
        }
    }

    fn ensure_initialized(&self, routine: Routine) -> Result<(), FlashError> {
        if self.initialized.is_none() {
            tracing::error!("{} called before init", routine);
            return Err(FlashError::NoAlgorithmLoaded);
        }
        Ok(())
    }
}

impl FlashAlgorithm for SimulatedFlash {
    fn load(&mut self, region: &FlashRegion, algorithm: &ProgramTarget) -> Result<(), FlashError> {
        if let Some((loaded, loaded_region)) = &mut self.loaded {
            if loaded == algorithm {
                *loaded_region = region.clone();
                return Ok(());
            }
        }

        tracing::debug!("Loading simulated flash algorithm {}", algorithm.name);
        self.counters.load += 1;
        self.loaded = Some((algorithm.clone(), region.clone()));
        Ok(())
    }

    fn unload(&mut self) {
        self.loaded = None;
    }

    fn init(
        &mut self,
        address: u32,
        _clock: u32,
        function: FlashFunction,
    ) -> Result<(), FlashError> {
        self.loaded()?;
        self.init_calls.push((address, function));
        if self.call(Routine::Init)? {
            self.initialized = Some(function);
        }
        Ok(())
    }

    fn uninit(&mut self, function: FlashFunction) -> Result<(), FlashError> {
        self.loaded()?;
        self.uninit_calls.push(function);
        self.initialized = None;
        self.call(Routine::UnInit)?;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        let (algorithm, region) = self.loaded()?;
        if !algorithm.supports_erase_chip() {
            return Err(FlashError::ChipEraseNotSupported);
        }

        let ranges: Vec<Range<u32>> = if self.regions.is_empty() {
            vec![region.range()]
        } else {
            self.regions
                .iter()
                .filter(|r| !r.is_alias && r.algorithm == algorithm.name)
                .map(|r| r.range())
                .collect()
        };

        self.ensure_initialized(Routine::EraseChip)?;
        if self.call(Routine::EraseChip)? {
            for range in ranges {
                self.memory.erase(range);
            }
        }
        Ok(())
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        let (_, region) = self.loaded()?;
        let sector = match region.sector_at(address) {
            Some(sector) if sector.start == address => sector,
            sector => {
                return Err(FlashError::AlignmentViolation {
                    address,
                    alignment: sector.map_or(0, |s| s.size),
                })
            }
        };

        self.ensure_initialized(Routine::EraseSector)?;
        self.erased_sectors.push(address);
        if self.call(Routine::EraseSector)? {
            self.memory.erase(sector.address_range());
        }
        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let (algorithm, _) = self.loaded()?;
        if data.len() > algorithm.program_buffer_size as usize {
            return Err(FlashError::PageTooLarge {
                size: data.len(),
                max: algorithm.program_buffer_size,
            });
        }
        let min_write_size = algorithm.min_write_size.max(1);
        if address % min_write_size != 0 || data.len() % min_write_size as usize != 0 {
            return Err(FlashError::AlignmentViolation {
                address,
                alignment: min_write_size,
            });
        }

        self.ensure_initialized(Routine::ProgramPage)?;
        self.programmed_pages.push((address, data.len()));
        if self.call(Routine::ProgramPage)? {
            self.memory.program(address, data);
        }
        Ok(())
    }

    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), FlashError> {
        self.counters.read += 1;
        self.memory.read(address, data);
        Ok(())
    }

    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let (algorithm, _) = self.loaded()?;
        if algorithm.verify.is_none() {
            return compare_read_back(self, address, data);
        }

        self.ensure_initialized(Routine::Verify)?;
        if !self.call(Routine::Verify)? {
            return Ok(());
        }

        let mut actual = vec![0; data.len()];
        self.memory.read(address, &mut actual);
        match data.iter().zip(&actual).position(|(e, a)| e != a) {
            Some(offset) => Err(FlashError::VerifyFailed {
                address: address + offset as u32,
            }),
            None => Ok(()),
        }
    }

    fn finish(&mut self, auto_reset: bool) -> Result<(), FlashError> {
        self.counters.finish += 1;
        self.last_finish = Some(auto_reset);
        self.loaded = None;
        Ok(())
    }

    fn max_page_size(&self) -> u32 {
        self.loaded
            .as_ref()
            .map_or(0, |(algorithm, _)| algorithm.program_buffer_size)
    }

    fn min_write_size(&self) -> u32 {
        self.loaded
            .as_ref()
            .map_or(1, |(algorithm, _)| algorithm.min_write_size)
    }

    fn erased_byte_value(&self) -> u8 {
        self.loaded
            .as_ref()
            .map_or(self.memory.fill, |(algorithm, _)| algorithm.erased_byte_value)
    }

    fn supports_erase_chip(&self) -> bool {
        self.loaded
            .as_ref()
            .is_some_and(|(algorithm, _)| algorithm.supports_erase_chip())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use daplink_target::Registry;
    use pretty_assertions::assert_eq;

    #[test]
    fn memory_programs_like_nor_flash() {
        let mut memory = SparseMemory::new(0xff);
        memory.program(0x100, &[0xf0, 0x0f]);
        memory.program(0x100, &[0x3c, 0xff]);

        let mut data = [0; 3];
        memory.read(0x100, &mut data);
        assert_eq!(data, [0x30, 0x0f, 0xff]);

        memory.erase(0x100..0x101);
        memory.read(0x100, &mut data);
        assert_eq!(data, [0xff, 0x0f, 0xff]);
    }

    fn loaded_flash() -> SimulatedFlash {
        let registry = Registry::from_builtin_boards();
        let target = registry.get_target_by_board_id("1102").unwrap();
        let mut flash = SimulatedFlash::for_target(target);
        flash
            .load(&target.flash_regions[0], &target.algorithms[0])
            .unwrap();
        flash
    }

    #[test]
    fn rejects_calls_before_init() {
        let mut flash = loaded_flash();
        assert!(matches!(
            flash.erase_sector(0x1000),
            Err(FlashError::NoAlgorithmLoaded)
        ));

        flash.init(0x0, 0, FlashFunction::Erase).unwrap();
        flash.erase_sector(0x1000).unwrap();
        assert!(matches!(
            flash.erase_sector(0x1004),
            Err(FlashError::AlignmentViolation {
                address: 0x1004,
                alignment: 0x1000
            })
        ));
        assert_eq!(flash.erased_sectors(), &[0x1000]);
    }

    #[test]
    fn injected_failures_hit_the_nth_call() {
        let mut flash = loaded_flash();
        flash.inject_failure(Routine::ProgramPage, 2, InjectedFailure::Timeout);
        flash.inject_failure(Routine::ProgramPage, 3, InjectedFailure::LockedUp);
        flash.init(0x0, 0, FlashFunction::Program).unwrap();

        flash.program_page(0x0, &[0; 4]).unwrap();
        assert!(matches!(
            flash.program_page(0x4, &[0; 4]),
            Err(FlashError::OperationTimedOut {
                routine: Routine::ProgramPage,
                ..
            })
        ));
        assert!(matches!(
            flash.program_page(0x8, &[0; 4]),
            Err(FlashError::UnexpectedCoreStatus { .. })
        ));
        assert_eq!(flash.counters().program_page, 3);
        assert_eq!(flash.contents(0x0, 12), [[0; 4], [0xff; 4], [0xff; 4]].concat());
    }

    #[test]
    fn page_limits() {
        let mut flash = loaded_flash();
        flash.init(0x0, 0, FlashFunction::Program).unwrap();

        assert!(matches!(
            flash.program_page(0x0, &[0; 0x204]),
            Err(FlashError::PageTooLarge {
                size: 0x204,
                max: 0x200
            })
        ));
        assert!(matches!(
            flash.program_page(0x0, &[0; 6]),
            Err(FlashError::AlignmentViolation { .. })
        ));
        assert_eq!(flash.counters().program_page, 0);
    }
}
