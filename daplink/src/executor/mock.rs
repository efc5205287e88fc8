#![allow(missing_docs)] // Don't require docs for test code

//! A simulated Cortex-M core for tests and dry runs.
//!
//! Instead of executing machine code, [`MockExecutor::run`] looks up the program counter
//! in a table of scripted entry points. Each entry point is a closure which receives the
//! argument registers and the target memory, and decides how the call ends.

use super::{CoreRegister, CoreStatus, ExecutorError, HaltReason, ResetState, TargetExecutor};
use crate::flashing::SparseMemory;
use daplink_target::{sector_map, TargetConfig};
use std::collections::HashMap;

/// How a scripted entry point ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Return to the breakpoint with the given value in R0.
    Return(u32),
    /// Never return.
    Hang,
    /// Fault and lock up the core.
    LockUp,
}

pub type EntryPointFn = Box<dyn FnMut(&mut SparseMemory, [u32; 4]) -> MockOutcome + Send>;

/// One resumption of the core.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub entry: u32,
    pub args: [u32; 4],
    pub static_base: u32,
    pub stack_pointer: u32,
    pub return_address: u32,
}

pub struct MockExecutor {
    pub memory: SparseMemory,
    registers: HashMap<CoreRegister, u32>,
    status: CoreStatus,
    entry_points: HashMap<u32, EntryPointFn>,
    calls: Vec<MockCall>,
    reset_states: Vec<ResetState>,
    corrupted_reads: Vec<u32>,
}

impl std::fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockExecutor")
            .field("status", &self.status)
            .field("registers", &self.registers)
            .field("entry_points", &self.entry_points.keys().collect::<Vec<_>>())
            .field("calls", &self.calls.len())
            .finish()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// A halted core without any entry points. Unwritten memory reads as `0xff`.
    pub fn new() -> Self {
        Self {
            memory: SparseMemory::new(0xff),
            registers: HashMap::new(),
            status: CoreStatus::Halted(HaltReason::Request),
            entry_points: HashMap::new(),
            calls: Vec::new(),
            reset_states: Vec::new(),
            corrupted_reads: Vec::new(),
        }
    }

    /// A core which runs every flash algorithm of `target` against its memory.
    ///
    /// `EraseSector` erases the sector at R0 per the target's sector map, `ProgramPage`
    /// copies R1 bytes from R2 to R0 with NOR semantics and `EraseChip` erases every
    /// region which is not an alias. `Verify` returns the first address at which flash and
    /// buffer differ, or the end of the range. `Init` and `UnInit` always succeed.
    pub fn with_flash_algorithms(target: &TargetConfig) -> Self {
        let mut executor = Self::new();

        for algorithm in &target.algorithms {
            executor.set_entry_point(algorithm.init, |_, _| MockOutcome::Return(0));
            executor.set_entry_point(algorithm.uninit, |_, _| MockOutcome::Return(0));

            let regions = target.flash_regions.clone();
            executor.set_entry_point(algorithm.erase_sector, move |memory, args| {
                match sector_map::sector_at(&regions, args[0]) {
                    Ok(sector) if sector.start == args[0] => {
                        memory.erase(sector.address_range());
                        MockOutcome::Return(0)
                    }
                    _ => MockOutcome::Return(1),
                }
            });

            executor.set_entry_point(algorithm.program_page, |memory, args| {
                let [address, len, buffer, _] = args;
                let mut data = vec![0; len as usize];
                memory.read(buffer, &mut data);
                memory.program(address, &data);
                MockOutcome::Return(0)
            });

            if let Some(verify) = algorithm.verify {
                executor.set_entry_point(verify, |memory, args| {
                    let [address, len, buffer, _] = args;
                    let mismatch = (0..len).find(|offset| {
                        memory.read_byte(address + offset) != memory.read_byte(buffer + offset)
                    });
                    MockOutcome::Return(address + mismatch.unwrap_or(len))
                });
            }

            if let Some(erase_chip) = algorithm.erase_chip {
                let regions = target.flash_regions.clone();
                executor.set_entry_point(erase_chip, move |memory, _| {
                    for region in regions.iter().filter(|r| !r.is_alias) {
                        memory.erase(region.range());
                    }
                    MockOutcome::Return(0)
                });
            }
        }

        executor
    }

    /// Script the routine at `address`. Replaces an earlier script for the same address.
    pub fn set_entry_point(
        &mut self,
        address: u32,
        entry: impl FnMut(&mut SparseMemory, [u32; 4]) -> MockOutcome + Send + 'static,
    ) {
        self.entry_points.insert(address, Box::new(entry));
    }

    /// Make the readback of `address` return inverted data.
    pub fn corrupt_reads_at(&mut self, address: u32) {
        self.corrupted_reads.push(address);
    }

    /// All calls made so far.
    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }

    /// All calls of the routine at `entry`.
    pub fn calls_to(&self, entry: u32) -> Vec<MockCall> {
        self.calls
            .iter()
            .filter(|call| call.entry == entry)
            .copied()
            .collect()
    }

    /// All reset states the target was put into.
    pub fn reset_states(&self) -> &[ResetState] {
        &self.reset_states
    }

    /// The last value written to `register`.
    pub fn register(&self, register: CoreRegister) -> Option<u32> {
        self.registers.get(&register).copied()
    }

    fn reg(&self, register: CoreRegister) -> u32 {
        self.register(register).unwrap_or(0)
    }
}

impl TargetExecutor for MockExecutor {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ExecutorError> {
        self.memory.write(address, data);
        Ok(())
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), ExecutorError> {
        self.memory.read(address, data);

        for corrupted in &self.corrupted_reads {
            if let Some(offset) = corrupted.checked_sub(address) {
                if let Some(byte) = data.get_mut(offset as usize) {
                    *byte = !*byte;
                }
            }
        }

        Ok(())
    }

    fn write_core_register(
        &mut self,
        register: CoreRegister,
        value: u32,
    ) -> Result<(), ExecutorError> {
        if !self.status.is_halted() {
            return Err(ExecutorError::RegisterAccess(register));
        }
        self.registers.insert(register, value);
        Ok(())
    }

    fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, ExecutorError> {
        if !self.status.is_halted() {
            return Err(ExecutorError::RegisterAccess(register));
        }
        Ok(self.reg(register))
    }

    fn run(&mut self) -> Result<(), ExecutorError> {
        let call = MockCall {
            entry: self.reg(CoreRegister::Pc),
            args: std::array::from_fn(|index| match CoreRegister::argument(index) {
                Some(register) => self.reg(register),
                None => 0,
            }),
            static_base: self.reg(CoreRegister::R9),
            stack_pointer: self.reg(CoreRegister::Sp),
            return_address: self.reg(CoreRegister::Lr),
        };
        self.calls.push(call);

        let outcome = match self.entry_points.get_mut(&call.entry) {
            Some(entry) => entry(&mut self.memory, call.args),
            // Jumping into unscripted code faults.
            None => MockOutcome::LockUp,
        };

        self.status = match outcome {
            MockOutcome::Return(result) => {
                self.registers.insert(CoreRegister::result(), result);
                self.registers
                    .insert(CoreRegister::Pc, call.return_address & !1);
                CoreStatus::Halted(HaltReason::Breakpoint)
            }
            MockOutcome::Hang => CoreStatus::Running,
            MockOutcome::LockUp => CoreStatus::LockedUp,
        };

        Ok(())
    }

    fn halt(&mut self) -> Result<(), ExecutorError> {
        if !self.status.is_halted() {
            self.status = CoreStatus::Halted(HaltReason::Request);
        }
        Ok(())
    }

    fn status(&mut self) -> Result<CoreStatus, ExecutorError> {
        Ok(self.status)
    }

    fn set_reset_state(&mut self, state: ResetState) -> Result<(), ExecutorError> {
        self.reset_states.push(state);
        self.status = match state {
            ResetState::Program => CoreStatus::Halted(HaltReason::Request),
            ResetState::Run => CoreStatus::Running,
        };
        Ok(())
    }
}
