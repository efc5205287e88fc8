//! Access to the target core which executes the flash algorithm blobs.
//!
//! The flashing engine never talks to a debug port directly. Everything it needs from
//! the target is expressed by the [`TargetExecutor`] trait, which a transport (SWD, JTAG
//! or a simulation) implements.

#[cfg(any(test, feature = "test"))]
pub mod mock;

/// The core registers the flash algorithm calling convention uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoreRegister {
    /// First argument and result register.
    R0,
    /// Second argument register.
    R1,
    /// Third argument register.
    R2,
    /// Fourth argument register.
    R3,
    /// Static base of position independent code.
    R9,
    /// Stack pointer.
    Sp,
    /// Link register, the return address of a call.
    Lr,
    /// Program counter.
    Pc,
    /// Program status register.
    Xpsr,
}

impl CoreRegister {
    /// The register holding argument `index`, if there is one.
    pub fn argument(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::R0),
            1 => Some(Self::R1),
            2 => Some(Self::R2),
            3 => Some(Self::R3),
            _ => None,
        }
    }

    /// The register holding the result of a call.
    pub fn result() -> Self {
        Self::R0
    }
}

impl std::fmt::Display for CoreRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::R0 => "R0",
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
            Self::R9 => "R9",
            Self::Sp => "SP",
            Self::Lr => "LR",
            Self::Pc => "PC",
            Self::Xpsr => "XPSR",
        };
        f.write_str(name)
    }
}

/// The reason why a core was halted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HaltReason {
    /// A breakpoint instruction was executed.
    Breakpoint,
    /// The debugger requested the halt.
    Request,
    /// The reason is not known.
    Unknown,
}

/// The status of the core.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CoreStatus {
    /// The core is running.
    Running,
    /// The core is halted.
    Halted(HaltReason),
    /// The core is locked up after an unrecoverable fault.
    LockedUp,
    /// The core is sleeping.
    Sleeping,
    /// The core status can not be determined.
    Unknown,
}

impl CoreStatus {
    /// Returns `true` if the core is halted.
    pub fn is_halted(&self) -> bool {
        matches!(self, CoreStatus::Halted(_))
    }
}

/// The state the debug adapter holds the target's reset line in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResetState {
    /// Reset the target and keep the core halted, ready to run flash algorithms.
    Program,
    /// Reset the target and let the application run.
    Run,
}

/// Failures of the transport to the target.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The target did not answer in time.
    #[error("The target did not respond in time.")]
    Timeout,
    /// A memory transfer failed.
    #[error("Memory access of {len} bytes at {address:#010x} failed.")]
    MemoryAccess {
        /// The first address of the transfer.
        address: u32,
        /// The length of the transfer.
        len: usize,
    },
    /// A core register could not be accessed.
    #[error("Access to core register {0} failed.")]
    RegisterAccess(CoreRegister),
    /// Any other error of the transport.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The operations the flashing engine needs from the target core.
pub trait TargetExecutor {
    /// Write `data` to target memory starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ExecutorError>;

    /// Fill `data` from target memory starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), ExecutorError>;

    /// Write a core register. The core must be halted.
    fn write_core_register(
        &mut self,
        register: CoreRegister,
        value: u32,
    ) -> Result<(), ExecutorError>;

    /// Read a core register. The core must be halted.
    fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, ExecutorError>;

    /// Resume the core.
    fn run(&mut self) -> Result<(), ExecutorError>;

    /// Request the core to halt.
    fn halt(&mut self) -> Result<(), ExecutorError>;

    /// The current status of the core.
    fn status(&mut self) -> Result<CoreStatus, ExecutorError>;

    /// Put the target into the given reset state.
    fn set_reset_state(&mut self, state: ResetState) -> Result<(), ExecutorError>;
}

impl<T: TargetExecutor + ?Sized> TargetExecutor for &mut T {
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), ExecutorError> {
        (**self).write_memory(address, data)
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), ExecutorError> {
        (**self).read_memory(address, data)
    }

    fn write_core_register(
        &mut self,
        register: CoreRegister,
        value: u32,
    ) -> Result<(), ExecutorError> {
        (**self).write_core_register(register, value)
    }

    fn read_core_register(&mut self, register: CoreRegister) -> Result<u32, ExecutorError> {
        (**self).read_core_register(register)
    }

    fn run(&mut self) -> Result<(), ExecutorError> {
        (**self).run()
    }

    fn halt(&mut self) -> Result<(), ExecutorError> {
        (**self).halt()
    }

    fn status(&mut self) -> Result<CoreStatus, ExecutorError> {
        (**self).status()
    }

    fn set_reset_state(&mut self, state: ResetState) -> Result<(), ExecutorError> {
        (**self).set_reset_state(state)
    }
}
