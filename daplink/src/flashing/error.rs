use super::Routine;
use crate::executor::{CoreStatus, ExecutorError};
use std::time::Duration;
use thiserror::Error;

/// Describes any error that happened during the or in preparation for the flashing procedure.
#[derive(Error, Debug)]
pub enum FlashError {
    /// No flash region contains the address, and the target has no default region.
    #[error("No flash region contains the address {address:#010x}.")]
    AddressOutOfRange {
        /// The requested address.
        address: u32,
    },
    /// The blob read back from target RAM differs from the blob that was written.
    #[error("The RAM contents did not match the flash algorithm '{name}' at {address:#010x} after loading it.")]
    AlgorithmLoadFailed {
        /// The name of the algorithm.
        name: String,
        /// The first address which differs.
        address: u32,
    },
    /// A routine did not return within its timeout.
    #[error("The '{routine}' routine did not return within {timeout:?}.")]
    OperationTimedOut {
        /// The routine which was called.
        routine: Routine,
        /// The timeout of the routine.
        timeout: Duration,
    },
    /// A routine returned a non zero result.
    #[error("The execution of '{routine}' failed with code {code}.")]
    AlgorithmReportedFailure {
        /// The routine which was called.
        routine: Routine,
        /// The value of R0 after the call.
        code: u32,
    },
    /// An address or length is not a multiple of the required alignment.
    #[error("The address {address:#010x} is not aligned to {alignment:#x} bytes.")]
    AlignmentViolation {
        /// The offending address.
        address: u32,
        /// The required alignment.
        alignment: u32,
    },
    /// The data does not fit into the program buffer.
    #[error("A page of {size} bytes exceeds the program buffer of {max} bytes.")]
    PageTooLarge {
        /// The size of the rejected page.
        size: usize,
        /// The size of the program buffer.
        max: u32,
    },
    /// The algorithm has no `EraseChip` routine.
    #[error("The flash algorithm does not support chip erase.")]
    ChipEraseNotSupported,
    /// Flash contents differ from the programmed data.
    #[error("Verification of the page at {address:#010x} failed.")]
    VerifyFailed {
        /// The address of the first differing byte.
        address: u32,
    },
    /// The core ended up in a state a routine call can not end in.
    #[error("The core entered the unexpected status {status:?} while running '{routine}'.")]
    UnexpectedCoreStatus {
        /// The routine which was called.
        routine: Routine,
        /// The status of the core.
        status: CoreStatus,
    },
    /// The operation was aborted by the caller.
    #[error("Flashing was aborted.")]
    Aborted,
    /// Another operation holds the debug port.
    #[error("The target is busy with '{holder}'.")]
    TargetBusy {
        /// The operation which holds the lock.
        holder: String,
    },
    /// A routine was called before an algorithm was loaded.
    #[error("No flash algorithm is loaded.")]
    NoAlgorithmLoaded,
    /// A region refers to an algorithm the target does not define.
    #[error("The target does not define the flash algorithm '{0}'.")]
    MissingAlgorithm(String),
    /// The transport to the target failed.
    #[error("Something during the interaction with the core went wrong")]
    Executor(#[from] ExecutorError),
}

/// The failure of a programming request.
#[derive(Error, Debug)]
#[error("Programming failed at address {address:#010x}")]
pub struct ProgramError {
    /// Address of the chunk which failed.
    pub address: u32,
    /// The original failure.
    #[source]
    pub error: FlashError,
    /// The failure of the `UnInit` call made while tearing down the session, if it failed too.
    pub teardown: Option<FlashError>,
}
