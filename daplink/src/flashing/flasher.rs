use super::flash_algorithm::compare_read_back;
use super::{FlashAlgorithm, FlashError, FlashFunction, Routine};
use crate::executor::{CoreRegister, CoreStatus, ResetState, TargetExecutor};
use daplink_target::{FlashRegion, ProgramTarget};
use std::time::{Duration, Instant};
use tracing::Level;

/// The value of xPSR for every call: only the Thumb bit is set.
const XPSR_THUMB: u32 = 0x0100_0000;

/// The state of the most recent flash algorithm invocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RunnerState {
    /// Nothing was invoked yet.
    Idle,
    /// The blob is being copied to target RAM.
    Loading,
    /// A routine is executing on the target.
    Running,
    /// The last routine returned.
    Completed,
    /// The last routine or load failed.
    Failed,
    /// The last routine did not return in time.
    TimedOut,
}

#[derive(Debug)]
struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Registers {
    fn new(pc: u32) -> Self {
        Self {
            pc,
            r0: None,
            r1: None,
            r2: None,
            r3: None,
        }
    }
}

#[derive(Debug)]
struct LoadedAlgorithm {
    algorithm: ProgramTarget,
    region: FlashRegion,
}

/// Runs a flash algorithm blob on the target through a [`TargetExecutor`].
///
/// The blob is copied to RAM once per session. Every routine call sets up the registers of
/// the calling convention, resumes the core and polls until it halts on the breakpoint at
/// the start of the blob.
#[derive(Debug)]
pub struct BlobRunner<E: TargetExecutor> {
    executor: E,
    loaded: Option<LoadedAlgorithm>,
    state: RunnerState,
    poll_interval: Duration,
}

impl<E: TargetExecutor> BlobRunner<E> {
    /// Create a runner which drives `executor`.
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            loaded: None,
            state: RunnerState::Idle,
            poll_interval: Duration::from_millis(1),
        }
    }

    /// The state of the last invocation.
    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// The executor driving the target.
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// The executor driving the target.
    pub fn executor_mut(&mut self) -> &mut E {
        &mut self.executor
    }

    /// Returns the executor.
    pub fn into_executor(self) -> E {
        self.executor
    }

    fn loaded(&self) -> Result<&LoadedAlgorithm, FlashError> {
        self.loaded.as_ref().ok_or(FlashError::NoAlgorithmLoaded)
    }

    fn load_blob(&mut self, algorithm: &ProgramTarget) -> Result<(), FlashError> {
        tracing::debug!("Initializing the flash algorithm {}.", algorithm.name);

        self.executor.set_reset_state(ResetState::Program)?;
        self.executor.halt()?;

        let span = tracing::debug_span!(
            "Loading algorithm into RAM",
            address = algorithm.algo_start
        )
        .entered();

        self.executor
            .write_memory(algorithm.algo_start, &algorithm.algo_blob)?;

        drop(span);

        let mut data = vec![0; algorithm.algo_blob.len()];
        self.executor
            .read_memory(algorithm.algo_start, &mut data)?;

        if let Some(offset) = algorithm
            .algo_blob
            .iter()
            .zip(data.iter())
            .position(|(original, read_back)| original != read_back)
        {
            let address = algorithm.algo_start + offset as u32;
            tracing::error!(
                "Failed to verify flash algorithm. Data mismatch at address {:#010x}",
                address
            );
            tracing::error!("Original: {:#04x}", algorithm.algo_blob[offset]);
            tracing::error!("Readback: {:#04x}", data[offset]);

            return Err(FlashError::AlgorithmLoadFailed {
                name: algorithm.name.clone(),
                address,
            });
        }

        tracing::debug!("RAM contents match flashing algo blob.");

        Ok(())
    }

    fn call_function_and_wait(
        &mut self,
        routine: Routine,
        registers: &Registers,
        timeout: Duration,
    ) -> Result<(), FlashError> {
        match self.call_and_read_result(routine, registers, timeout)? {
            0 => Ok(()),
            code => {
                self.state = RunnerState::Failed;
                Err(FlashError::AlgorithmReportedFailure { routine, code })
            }
        }
    }

    /// Calls a routine and returns R0 once it halted.
    fn call_and_read_result(
        &mut self,
        routine: Routine,
        registers: &Registers,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        self.state = RunnerState::Running;

        let result = self
            .call_function(registers)
            .and_then(|_| self.wait_for_completion(routine, timeout));

        self.state = match &result {
            Ok(_) => RunnerState::Completed,
            Err(FlashError::OperationTimedOut { .. }) => RunnerState::TimedOut,
            Err(_) => RunnerState::Failed,
        };

        result
    }

    fn call_function(&mut self, registers: &Registers) -> Result<(), FlashError> {
        tracing::debug!("Calling routine {:x?}", &registers);

        let sys_call = self.loaded()?.algorithm.sys_call;

        if !self.executor.status()?.is_halted() {
            self.executor.halt()?;
        }

        let registers = [
            (CoreRegister::R0, registers.r0),
            (CoreRegister::R1, registers.r1),
            (CoreRegister::R2, registers.r2),
            (CoreRegister::R3, registers.r3),
            (CoreRegister::R9, Some(sys_call.static_base)),
            (CoreRegister::Sp, Some(sys_call.stack_pointer)),
            (CoreRegister::Lr, Some(sys_call.breakpoint)),
            (CoreRegister::Xpsr, Some(XPSR_THUMB)),
            (CoreRegister::Pc, Some(registers.pc)),
        ];

        for (register, value) in registers {
            if let Some(v) = value {
                self.executor.write_core_register(register, v)?;

                if tracing::enabled!(Level::TRACE) {
                    let value = self.executor.read_core_register(register)?;

                    tracing::trace!(
                        "content of {}: {:#010x} should be: {:#010x}",
                        register,
                        value,
                        v
                    );
                }
            }
        }

        // Resume target operation.
        self.executor.run()?;

        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn wait_for_completion(
        &mut self,
        routine: Routine,
        timeout: Duration,
    ) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");

        // Wait until halted state is active again.
        let start = Instant::now();

        loop {
            match self.executor.status()? {
                CoreStatus::Halted(_) => break,
                CoreStatus::LockedUp => {
                    return Err(FlashError::UnexpectedCoreStatus {
                        routine,
                        status: CoreStatus::LockedUp,
                    });
                }
                _ => {
                    // All other statuses are okay: we'll just keep polling.
                }
            }

            if start.elapsed() >= timeout {
                tracing::warn!(
                    "Routine {} timed out after {:?}, halting the core.",
                    routine,
                    timeout
                );
                self.executor.halt()?;
                return Err(FlashError::OperationTimedOut { routine, timeout });
            }

            std::thread::sleep(self.poll_interval);
        }

        let r = self.executor.read_core_register(CoreRegister::result())?;
        Ok(r)
    }
}

impl<E: TargetExecutor> FlashAlgorithm for BlobRunner<E> {
    fn load(&mut self, region: &FlashRegion, algorithm: &ProgramTarget) -> Result<(), FlashError> {
        if let Some(loaded) = &mut self.loaded {
            if loaded.algorithm == *algorithm {
                tracing::debug!("Flash algorithm {} is already loaded.", algorithm.name);
                loaded.region = region.clone();
                return Ok(());
            }
        }

        self.loaded = None;
        self.state = RunnerState::Loading;

        if let Err(error) = self.load_blob(algorithm) {
            self.state = RunnerState::Failed;
            return Err(error);
        }

        self.loaded = Some(LoadedAlgorithm {
            algorithm: algorithm.clone(),
            region: region.clone(),
        });
        self.state = RunnerState::Completed;

        Ok(())
    }

    fn unload(&mut self) {
        self.loaded = None;
    }

    #[tracing::instrument(name = "Call to flash algorithm init", skip(self, clock))]
    fn init(
        &mut self,
        address: u32,
        clock: u32,
        function: FlashFunction,
    ) -> Result<(), FlashError> {
        let algorithm = &self.loaded()?.algorithm;
        let timeout = algorithm.timeouts.init();

        let registers = Registers {
            r0: Some(address),
            r1: Some(clock),
            r2: Some(function.code()),
            ..Registers::new(algorithm.init)
        };
        self.call_function_and_wait(Routine::Init, &registers, timeout)
    }

    fn uninit(&mut self, function: FlashFunction) -> Result<(), FlashError> {
        tracing::debug!("Running uninit routine.");
        let algorithm = &self.loaded()?.algorithm;
        let timeout = algorithm.timeouts.uninit();

        let registers = Registers {
            r0: Some(function.code()),
            ..Registers::new(algorithm.uninit)
        };
        self.call_function_and_wait(Routine::UnInit, &registers, timeout)
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        tracing::debug!("Erasing entire chip.");
        let algorithm = &self.loaded()?.algorithm;
        let timeout = algorithm.timeouts.erase_chip();
        let Some(pc_erase_chip) = algorithm.erase_chip else {
            return Err(FlashError::ChipEraseNotSupported);
        };

        let registers = Registers::new(pc_erase_chip);
        self.call_function_and_wait(Routine::EraseChip, &registers, timeout)
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        let loaded = self.loaded()?;
        let timeout = loaded.algorithm.timeouts.erase_sector();
        let pc_erase_sector = loaded.algorithm.erase_sector;

        match loaded.region.sector_at(address) {
            Some(sector) if sector.start == address => {}
            sector => {
                return Err(FlashError::AlignmentViolation {
                    address,
                    alignment: sector.map_or(0, |s| s.size),
                })
            }
        }

        tracing::info!("Erasing sector at address {:#010x}", address);
        let t1 = Instant::now();

        let registers = Registers {
            r0: Some(address),
            ..Registers::new(pc_erase_sector)
        };
        self.call_function_and_wait(Routine::EraseSector, &registers, timeout)?;

        tracing::info!("Done erasing sector. This took {:?}", t1.elapsed());

        Ok(())
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let algorithm = &self.loaded()?.algorithm;
        let timeout = algorithm.timeouts.program_page();
        let pc_program_page = algorithm.program_page;
        let program_buffer = algorithm.program_buffer;
        let min_write_size = algorithm.min_write_size;

        if data.len() > algorithm.program_buffer_size as usize {
            return Err(FlashError::PageTooLarge {
                size: data.len(),
                max: algorithm.program_buffer_size,
            });
        }

        if address % min_write_size != 0 || data.len() % min_write_size as usize != 0 {
            return Err(FlashError::AlignmentViolation {
                address,
                alignment: min_write_size,
            });
        }

        let t1 = Instant::now();

        tracing::info!(
            "Flashing page at address {:#010x} with size: {}",
            address,
            data.len()
        );

        // Transfer the bytes to RAM.
        self.executor.write_memory(program_buffer, data)?;

        let registers = Registers {
            r0: Some(address),
            r1: Some(data.len() as u32),
            r2: Some(program_buffer),
            ..Registers::new(pc_program_page)
        };
        self.call_function_and_wait(Routine::ProgramPage, &registers, timeout)?;

        tracing::info!("Flashing took: {:?}", t1.elapsed());

        Ok(())
    }

    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), FlashError> {
        self.executor.read_memory(address, data)?;
        Ok(())
    }

    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let algorithm = &self.loaded()?.algorithm;
        let Some(pc_verify) = algorithm.verify else {
            return compare_read_back(self, address, data);
        };
        let timeout = algorithm.timeouts.program_page();
        let program_buffer = algorithm.program_buffer;

        if data.len() > algorithm.program_buffer_size as usize {
            return Err(FlashError::PageTooLarge {
                size: data.len(),
                max: algorithm.program_buffer_size,
            });
        }

        tracing::debug!(
            "Verifying {} bytes at address {:#010x}",
            data.len(),
            address
        );
        self.executor.write_memory(program_buffer, data)?;

        let registers = Registers {
            r0: Some(address),
            r1: Some(data.len() as u32),
            r2: Some(program_buffer),
            ..Registers::new(pc_verify)
        };
        let end = address.wrapping_add(data.len() as u32);

        // Verify returns the end of the checked range, or the first address that differs.
        match self.call_and_read_result(Routine::Verify, &registers, timeout)? {
            result if result == end => Ok(()),
            result => {
                self.state = RunnerState::Failed;
                tracing::error!("Verification failed at {:#010x}", result);
                Err(FlashError::VerifyFailed { address: result })
            }
        }
    }

    fn finish(&mut self, auto_reset: bool) -> Result<(), FlashError> {
        let state = if auto_reset {
            ResetState::Run
        } else {
            ResetState::Program
        };
        tracing::debug!("Releasing target in reset state {:?}", state);

        // The target RAM is not ours anymore.
        self.loaded = None;
        self.executor.set_reset_state(state)?;

        Ok(())
    }

    fn max_page_size(&self) -> u32 {
        self.loaded
            .as_ref()
            .map_or(0, |l| l.algorithm.program_buffer_size)
    }

    fn min_write_size(&self) -> u32 {
        self.loaded
            .as_ref()
            .map_or(1, |l| l.algorithm.min_write_size)
    }

    fn erased_byte_value(&self) -> u8 {
        self.loaded
            .as_ref()
            .map_or(0xff, |l| l.algorithm.erased_byte_value)
    }

    fn supports_erase_chip(&self) -> bool {
        self.loaded
            .as_ref()
            .is_some_and(|l| l.algorithm.supports_erase_chip())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::executor::mock::{MockExecutor, MockOutcome};
    use daplink_target::{SectorInfo, SysCallParams};
    use pretty_assertions::assert_eq;

    fn algorithm() -> ProgramTarget {
        ProgramTarget {
            name: "test".to_string(),
            init: 0x2000_0021,
            uninit: 0x2000_0031,
            erase_chip: None,
            erase_sector: 0x2000_0051,
            program_page: 0x2000_0061,
            verify: None,
            sys_call: SysCallParams {
                breakpoint: 0x2000_0001,
                static_base: 0x2000_0080,
                stack_pointer: 0x2000_1000,
            },
            program_buffer: 0x2000_1000,
            program_buffer_size: 0x100,
            algo_start: 0x2000_0000,
            algo_blob: vec![0x00, 0xbe, 0x0a, 0xe0, 0x70, 0x47, 0x00, 0x00],
            min_write_size: 4,
            erased_byte_value: 0xff,
            timeouts: daplink_target::AlgorithmTimeouts {
                erase_sector: 20,
                ..Default::default()
            },
        }
    }

    fn region() -> FlashRegion {
        FlashRegion {
            name: Some("flash".to_string()),
            start: 0x0,
            end: 0x1000,
            sector_table: vec![SectorInfo {
                start: 0x0,
                size: 0x400,
            }],
            algorithm: "test".to_string(),
            default: false,
            is_alias: false,
        }
    }

    fn runner() -> BlobRunner<MockExecutor> {
        let mut executor = MockExecutor::new();
        let algorithm = algorithm();
        for entry in [
            algorithm.init,
            algorithm.uninit,
            algorithm.erase_sector,
            algorithm.program_page,
        ] {
            executor.set_entry_point(entry, |_, _| MockOutcome::Return(0));
        }
        BlobRunner::new(executor)
    }

    #[test]
    fn load_copies_blob_once() {
        let mut runner = runner();
        assert_eq!(runner.state(), RunnerState::Idle);

        runner.load(&region(), &algorithm()).unwrap();
        runner.load(&region(), &algorithm()).unwrap();

        let mut blob = [0; 8];
        runner.executor_mut().memory.read(0x2000_0000, &mut blob);
        assert_eq!(blob.to_vec(), algorithm().algo_blob);
        assert_eq!(runner.executor().reset_states(), &[ResetState::Program]);
        assert_eq!(runner.max_page_size(), 0x100);
    }

    #[test]
    fn load_detects_readback_mismatch() {
        let mut runner = runner();
        runner.executor_mut().corrupt_reads_at(0x2000_0005);

        let error = runner.load(&region(), &algorithm()).unwrap_err();
        assert!(matches!(
            error,
            FlashError::AlgorithmLoadFailed {
                address: 0x2000_0005,
                ..
            }
        ));
        assert_eq!(runner.state(), RunnerState::Failed);
        assert!(matches!(
            runner.init(0, 0, FlashFunction::Program),
            Err(FlashError::NoAlgorithmLoaded)
        ));
    }

    #[test]
    fn init_follows_calling_convention() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();
        runner.init(0x0, 12_000_000, FlashFunction::Program).unwrap();

        let calls = runner.executor().calls();
        assert_eq!(calls.len(), 1);
        let call = calls[0];
        assert_eq!(call.entry, 0x2000_0021);
        assert_eq!(call.args[..3], [0x0, 12_000_000, 2]);
        assert_eq!(call.static_base, 0x2000_0080);
        assert_eq!(call.stack_pointer, 0x2000_1000);
        assert_eq!(call.return_address, 0x2000_0001);
        assert_eq!(
            runner.executor().register(CoreRegister::Xpsr),
            Some(XPSR_THUMB)
        );
        assert_eq!(runner.state(), RunnerState::Completed);
    }

    #[test]
    fn non_zero_result_is_a_failure() {
        let mut runner = runner();
        runner
            .executor_mut()
            .set_entry_point(0x2000_0031, |_, _| MockOutcome::Return(7));
        runner.load(&region(), &algorithm()).unwrap();

        assert!(matches!(
            runner.uninit(FlashFunction::Erase),
            Err(FlashError::AlgorithmReportedFailure {
                routine: Routine::UnInit,
                code: 7
            })
        ));
        assert_eq!(runner.state(), RunnerState::Failed);
    }

    #[test]
    fn hanging_routine_times_out_and_halts() {
        let mut runner = runner();
        runner
            .executor_mut()
            .set_entry_point(0x2000_0051, |_, _| MockOutcome::Hang);
        runner.load(&region(), &algorithm()).unwrap();

        assert!(matches!(
            runner.erase_sector(0x400),
            Err(FlashError::OperationTimedOut {
                routine: Routine::EraseSector,
                ..
            })
        ));
        assert_eq!(runner.state(), RunnerState::TimedOut);
        assert!(runner.executor_mut().status().unwrap().is_halted());
    }

    #[test]
    fn locked_up_core() {
        let mut runner = runner();
        runner
            .executor_mut()
            .set_entry_point(0x2000_0061, |_, _| MockOutcome::LockUp);
        runner.load(&region(), &algorithm()).unwrap();

        assert!(matches!(
            runner.program_page(0x0, &[0; 4]),
            Err(FlashError::UnexpectedCoreStatus {
                status: CoreStatus::LockedUp,
                ..
            })
        ));
    }

    #[test]
    fn program_page_checks() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();

        assert!(matches!(
            runner.program_page(0x0, &[0; 0x104]),
            Err(FlashError::PageTooLarge {
                size: 0x104,
                max: 0x100
            })
        ));
        assert!(matches!(
            runner.program_page(0x2, &[0; 4]),
            Err(FlashError::AlignmentViolation {
                address: 0x2,
                alignment: 4
            })
        ));
        assert!(matches!(
            runner.program_page(0x0, &[0; 3]),
            Err(FlashError::AlignmentViolation { .. })
        ));
        assert!(runner.executor().calls().is_empty());

        runner.program_page(0x100, &[1, 2, 3, 4]).unwrap();
        let call = runner.executor().calls()[0];
        assert_eq!(call.args[..3], [0x100, 4, 0x2000_1000]);
        let mut staged = [0; 4];
        runner.executor_mut().memory.read(0x2000_1000, &mut staged);
        assert_eq!(staged, [1, 2, 3, 4]);
    }

    #[test]
    fn erase_sector_requires_sector_start() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();

        assert!(matches!(
            runner.erase_sector(0x404),
            Err(FlashError::AlignmentViolation {
                address: 0x404,
                alignment: 0x400
            })
        ));
        runner.erase_sector(0x800).unwrap();
    }

    #[test]
    fn chip_erase_not_supported() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();

        assert!(!runner.supports_erase_chip());
        assert!(matches!(
            runner.erase_chip(),
            Err(FlashError::ChipEraseNotSupported)
        ));
    }

    #[test]
    fn verify_without_routine_reads_back() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();
        runner.executor_mut().memory.write(0x100, &[1, 2, 3, 4]);

        runner.verify(0x100, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            runner.verify(0x100, &[1, 2, 9, 4]),
            Err(FlashError::VerifyFailed { address: 0x102 })
        ));
        assert!(runner.executor().calls().is_empty());
    }

    #[test]
    fn finish_releases_target() {
        let mut runner = runner();
        runner.load(&region(), &algorithm()).unwrap();
        runner.finish(true).unwrap();

        assert_eq!(
            runner.executor().reset_states(),
            &[ResetState::Program, ResetState::Run]
        );
        assert!(matches!(
            runner.erase_sector(0x0),
            Err(FlashError::NoAlgorithmLoaded)
        ));
    }
}
