use super::FlashError;
use daplink_target::{FlashRegion, ProgramTarget};

/// The operation a flash algorithm is initialized for.
///
/// The value is passed to the `Init` and `UnInit` routines.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlashFunction {
    /// Erase sectors or the whole chip.
    Erase = 1,
    /// Program pages.
    Program = 2,
    /// Verify flash contents.
    Verify = 3,
}

impl FlashFunction {
    /// The code passed to the flash algorithm.
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// The routines of a flash algorithm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Routine {
    /// `Init(address, clock, function)`
    Init,
    /// `UnInit(function)`
    UnInit,
    /// `EraseChip()`
    EraseChip,
    /// `EraseSector(address)`
    EraseSector,
    /// `ProgramPage(address, size, buffer)`
    ProgramPage,
    /// `Verify(address, size, buffer)`
    Verify,
}

impl std::fmt::Display for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Routine::Init => "init",
            Routine::UnInit => "uninit",
            Routine::EraseChip => "erase_chip",
            Routine::EraseSector => "erase_sector",
            Routine::ProgramPage => "program_page",
            Routine::Verify => "verify",
        };
        f.write_str(name)
    }
}

/// A flash algorithm which can erase and program the flash of one target region.
///
/// All routines return `Ok(())` when the algorithm reported success. The page geometry
/// accessors describe the most recently loaded algorithm.
pub trait FlashAlgorithm {
    /// Make `algorithm` available for programming `region`.
    ///
    /// Loading the algorithm which is already loaded only switches the region.
    fn load(&mut self, region: &FlashRegion, algorithm: &ProgramTarget) -> Result<(), FlashError>;

    /// Forget the loaded algorithm, so the next [`FlashAlgorithm::load`] starts over.
    fn unload(&mut self) {}

    /// Prepare the flash for `function`.
    fn init(&mut self, address: u32, clock: u32, function: FlashFunction)
        -> Result<(), FlashError>;

    /// Undo [`FlashAlgorithm::init`].
    fn uninit(&mut self, function: FlashFunction) -> Result<(), FlashError>;

    /// Erase the whole flash.
    fn erase_chip(&mut self) -> Result<(), FlashError>;

    /// Erase the sector starting at `address`.
    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Program `data` to `address`.
    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read back flash contents.
    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), FlashError>;

    /// Check that the flash at `address` holds `data`.
    ///
    /// Algorithms without a `Verify` routine compare a read back.
    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        compare_read_back(self, address, data)
    }

    /// Release the target, either running the new firmware or held in reset.
    fn finish(&mut self, auto_reset: bool) -> Result<(), FlashError>;

    /// The largest page [`FlashAlgorithm::program_page`] accepts.
    fn max_page_size(&self) -> u32;

    /// Every page address and length must be a multiple of this.
    fn min_write_size(&self) -> u32;

    /// The value of an erased byte.
    fn erased_byte_value(&self) -> u8;

    /// Whether [`FlashAlgorithm::erase_chip`] is available.
    fn supports_erase_chip(&self) -> bool;
}

impl<T: FlashAlgorithm + ?Sized> FlashAlgorithm for &mut T {
    fn load(&mut self, region: &FlashRegion, algorithm: &ProgramTarget) -> Result<(), FlashError> {
        (**self).load(region, algorithm)
    }

    fn unload(&mut self) {
        (**self).unload()
    }

    fn init(
        &mut self,
        address: u32,
        clock: u32,
        function: FlashFunction,
    ) -> Result<(), FlashError> {
        (**self).init(address, clock, function)
    }

    fn uninit(&mut self, function: FlashFunction) -> Result<(), FlashError> {
        (**self).uninit(function)
    }

    fn erase_chip(&mut self) -> Result<(), FlashError> {
        (**self).erase_chip()
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        (**self).erase_sector(address)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).program_page(address, data)
    }

    fn read(&mut self, address: u32, data: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(address, data)
    }

    fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).verify(address, data)
    }

    fn finish(&mut self, auto_reset: bool) -> Result<(), FlashError> {
        (**self).finish(auto_reset)
    }

    fn max_page_size(&self) -> u32 {
        (**self).max_page_size()
    }

    fn min_write_size(&self) -> u32 {
        (**self).min_write_size()
    }

    fn erased_byte_value(&self) -> u8 {
        (**self).erased_byte_value()
    }

    fn supports_erase_chip(&self) -> bool {
        (**self).supports_erase_chip()
    }
}

/// Reads `expected.len()` bytes at `address` and compares them to `expected`.
pub(super) fn compare_read_back<A: FlashAlgorithm + ?Sized>(
    algorithm: &mut A,
    address: u32,
    expected: &[u8],
) -> Result<(), FlashError> {
    let mut actual = vec![0; expected.len()];
    algorithm.read(address, &mut actual)?;

    match expected.iter().zip(&actual).position(|(e, a)| e != a) {
        Some(offset) => {
            let address = address + offset as u32;
            tracing::error!(
                "Verification failed at {:#010x}: expected {:#04x}, read {:#04x}",
                address,
                expected[offset],
                actual[offset]
            );
            Err(FlashError::VerifyFailed { address })
        }
        None => Ok(()),
    }
}
