use super::{FlashAlgorithm, FlashError, FlashFunction, FlashProgress, ProgramError};
use crate::lock::{DapLock, DapLockGuard};
use daplink_target::{sector_map, FlashRegion, Sector, TargetConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Options of a [`FlashSequencer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerOptions {
    /// Clock frequency passed to the `Init` routine. Zero lets the algorithm decide.
    pub clock: u32,
    /// Read back every page after programming it.
    pub verify: bool,
    /// Let the target run once programming is finished.
    pub auto_reset: bool,
    /// Use the `EraseChip` routine for erasing everything, if the algorithm has one.
    pub chip_erase: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            clock: 0,
            verify: false,
            auto_reset: true,
            chip_erase: true,
        }
    }
}

/// Requests cancellation of a running [`FlashSequencer`].
///
/// The flag is checked before every page, so the page in progress is always completed.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Abort at the next page boundary.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear an abort request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// An open `Init`..`UnInit` bracket for one region.
pub(super) struct Session<'t> {
    region: &'t FlashRegion,
    function: FlashFunction,
    /// Starts of the sectors erased in this session.
    erased: BTreeSet<u32>,
    /// Data collected for the next `ProgramPage` call.
    pending: Option<PendingPage>,
    _guard: Option<DapLockGuard>,
}

/// Bytes staged for one `ProgramPage` call.
#[derive(Debug)]
struct PendingPage {
    address: u32,
    data: Vec<u8>,
    /// Limited by the page size and by the end of the sector.
    end: u64,
}

impl PendingPage {
    fn next_address(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    fn is_full(&self) -> bool {
        self.next_address() == self.end
    }
}

/// Drives a [`FlashAlgorithm`] to program data into the flash of a target.
///
/// Data is split along the sector map of the target. Each sector is erased the first time
/// data is written to it within a session, and each page is at most the program buffer long
/// and never crosses a sector.
///
/// Incoming bytes are collected into a page. A page is programmed once it is full, once a
/// request does not continue it, or on [`finish`](FlashSequencer::finish), so requests may
/// split a write unit.
pub struct FlashSequencer<'t, A: FlashAlgorithm> {
    pub(super) target: &'t TargetConfig,
    pub(super) algorithm: A,
    pub(super) options: SequencerOptions,
    pub(super) progress: FlashProgress,
    lock: Option<DapLock>,
    pub(super) abort: AbortHandle,
    session: Option<Session<'t>>,
}

impl<'t, A: FlashAlgorithm> FlashSequencer<'t, A> {
    /// Create a sequencer for `target` which uses `algorithm`.
    pub fn new(target: &'t TargetConfig, algorithm: A, options: SequencerOptions) -> Self {
        Self {
            target,
            algorithm,
            options,
            progress: FlashProgress::empty(),
            lock: None,
            abort: AbortHandle::default(),
            session: None,
        }
    }

    /// Report progress to `progress`.
    pub fn with_progress(mut self, progress: FlashProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Hold `lock` while a session is open.
    pub fn with_lock(mut self, lock: DapLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// A handle which aborts this sequencer.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// The target this sequencer programs.
    pub fn target(&self) -> &'t TargetConfig {
        self.target
    }

    /// The flash algorithm.
    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// The flash algorithm.
    pub fn algorithm_mut(&mut self) -> &mut A {
        &mut self.algorithm
    }

    /// Returns `true` while the flash algorithm is initialized.
    pub fn is_session_open(&self) -> bool {
        self.session.is_some()
    }

    /// Program `data` to `address`.
    ///
    /// The last page of `data` may stay buffered until the next request or
    /// [`finish`](FlashSequencer::finish). On failure the session is torn down: `UnInit` is
    /// called once, and its own failure is reported as [`ProgramError::teardown`]. Buffered
    /// bytes are dropped, and [`ProgramError::address`] is the first address which was not
    /// programmed.
    pub fn program(&mut self, address: u32, data: &[u8]) -> Result<(), ProgramError> {
        if address as u64 + data.len() as u64 > u32::MAX as u64 + 1 {
            return Err(self.fail(address, FlashError::AddressOutOfRange { address }));
        }

        let mut offset = 0;
        while offset < data.len() {
            let chunk_address = address + offset as u32;
            match self.buffer_chunk(chunk_address, &data[offset..]) {
                Ok(written) => offset += written,
                Err(error) => return Err(self.fail(chunk_address, error)),
            }
        }

        Ok(())
    }

    /// Adds the start of `data` to the pending page and returns the number of bytes taken.
    fn buffer_chunk(&mut self, address: u32, data: &[u8]) -> Result<usize, FlashError> {
        if self.abort.is_aborted() {
            tracing::info!("Flashing aborted at {:#010x}", address);
            return Err(FlashError::Aborted);
        }

        if let Some(page) = self.session.as_mut().and_then(|s| s.pending.as_mut()) {
            if page.next_address() == address as u64 {
                let len = data.len().min((page.end - page.next_address()) as usize);
                page.data.extend_from_slice(&data[..len]);
                let full = page.is_full();

                if full {
                    self.flush_page()?;
                }
                return Ok(len);
            }
        }
        self.flush_page()?;

        let target = self.target;
        let region = sector_map::region_for_address(&target.flash_regions, address)
            .ok_or(FlashError::AddressOutOfRange { address })?;
        self.ensure_session(region, FlashFunction::Program)?;

        let min_write_size = self.algorithm.min_write_size().max(1);
        if address % min_write_size != 0 {
            return Err(FlashError::AlignmentViolation {
                address,
                alignment: min_write_size,
            });
        }

        let sector = region
            .sector_at(address)
            .ok_or(FlashError::AddressOutOfRange { address })?;
        self.erase_once(sector)?;

        let page_size = self.algorithm.max_page_size().max(min_write_size);
        let sector_end = sector.start as u64 + sector.size as u64;
        let end = (address as u64 + page_size as u64).min(sector_end);
        let len = data.len().min((end - address as u64) as usize);

        let page = PendingPage {
            address,
            data: data[..len].to_vec(),
            end,
        };
        let full = page.is_full();
        let session = self.session.as_mut().ok_or(FlashError::NoAlgorithmLoaded)?;
        session.pending = Some(page);

        if full {
            self.flush_page()?;
        }
        Ok(len)
    }

    /// Programs the pending page, padding its last write unit with the erased value.
    ///
    /// A page which fails stays pending, so its address can be reported.
    fn flush_page(&mut self) -> Result<(), FlashError> {
        let Some(mut page) = self.session.as_mut().and_then(|s| s.pending.take()) else {
            return Ok(());
        };

        let min_write_size = self.algorithm.min_write_size().max(1) as usize;
        let padded_len = page.data.len().next_multiple_of(min_write_size);
        page.data
            .resize(padded_len, self.algorithm.erased_byte_value());

        let t1 = Instant::now();
        let mut result = self.algorithm.program_page(page.address, &page.data);
        if result.is_ok() && self.options.verify {
            result = self.algorithm.verify(page.address, &page.data);
        }

        match result {
            Ok(()) => {
                self.progress
                    .page_programmed(page.address, page.data.len() as u32, t1.elapsed());
                Ok(())
            }
            Err(error) => {
                if let Some(session) = self.session.as_mut() {
                    session.pending = Some(page);
                }
                Err(error)
            }
        }
    }

    fn erase_once(&mut self, sector: Sector) -> Result<(), FlashError> {
        let session = self.session.as_mut().ok_or(FlashError::NoAlgorithmLoaded)?;
        if session.erased.contains(&sector.start) {
            return Ok(());
        }

        let t1 = Instant::now();
        self.algorithm.erase_sector(sector.start)?;
        session.erased.insert(sector.start);

        self.progress
            .sector_erased(sector.start, sector.size, t1.elapsed());

        Ok(())
    }

    /// Tears the session down after `error`, and builds the error for the caller.
    fn fail(&mut self, address: u32, error: FlashError) -> ProgramError {
        let address = self
            .session
            .as_mut()
            .and_then(|s| s.pending.take())
            .map_or(address, |page| page.address);
        tracing::debug!("Programming failed at {:#010x}: {}", address, error);

        let teardown = self.close_session().err();
        if let Some(teardown) = &teardown {
            tracing::warn!("Failed to uninitialize the flash algorithm: {}", teardown);
        }

        self.progress.failed(address);

        ProgramError {
            address,
            error,
            teardown,
        }
    }

    /// Commit everything programmed so far.
    ///
    /// Programs the pending page, calls `UnInit` and releases the target, if a session is
    /// open. `UnInit` is called even if the pending page fails.
    pub fn finish(&mut self) -> Result<(), FlashError> {
        if self.session.is_none() {
            return Ok(());
        }

        let flush = self.flush_page();
        if let Err(error) = &flush {
            tracing::warn!("Failed to program the last page: {}", error);
        }
        let uninit = self.close_session();
        let finish = self.algorithm.finish(self.options.auto_reset);
        flush.and(uninit).and(finish)?;

        self.progress.session_finished();

        Ok(())
    }

    /// Program `data` to `address` and [`finish`](FlashSequencer::finish).
    pub fn download(&mut self, address: u32, data: &[u8]) -> Result<(), ProgramError> {
        self.program(address, data)?;
        self.finish().map_err(|error| ProgramError {
            address,
            error,
            teardown: None,
        })
    }

    /// Keeps the open session if it matches, else switches to a new one.
    fn ensure_session(
        &mut self,
        region: &'t FlashRegion,
        function: FlashFunction,
    ) -> Result<(), FlashError> {
        if let Some(session) = &self.session {
            if std::ptr::eq(session.region, region) && session.function == function {
                return Ok(());
            }
            tracing::debug!(
                "Switching flash session from {:#010x?} to {:#010x?}",
                session.region.range(),
                region.range()
            );
        }

        self.close_session()?;
        self.open_session(region, function)
    }

    pub(super) fn open_session(
        &mut self,
        region: &'t FlashRegion,
        function: FlashFunction,
    ) -> Result<(), FlashError> {
        let operation = match function {
            FlashFunction::Erase => "erase",
            FlashFunction::Program => "program",
            FlashFunction::Verify => "verify",
        };
        let guard = self
            .lock
            .as_ref()
            .map(|lock| lock.try_lock(operation))
            .transpose()?;

        let algorithm = self
            .target
            .algorithm_for(region)
            .ok_or_else(|| FlashError::MissingAlgorithm(region.algorithm.clone()))?;

        tracing::debug!(
            "Opening {} session for {:#010x?} with {}",
            operation,
            region.range(),
            algorithm.name
        );
        self.algorithm.load(region, algorithm)?;

        // From here on, a failure tears the session down with UnInit.
        self.session = Some(Session {
            region,
            function,
            erased: BTreeSet::new(),
            pending: None,
            _guard: guard,
        });

        self.algorithm
            .init(region.start, self.options.clock, function)?;
        self.progress.session_started(region.range());

        Ok(())
    }

    pub(super) fn close_session(&mut self) -> Result<(), FlashError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        tracing::debug!("Closing flash session for {:#010x?}", session.region.range());
        if let Some(page) = &session.pending {
            tracing::warn!(
                "Dropping {} unprogrammed bytes at {:#010x}",
                page.data.len(),
                page.address
            );
        }
        self.algorithm.uninit(session.function)
    }
}

impl<A: FlashAlgorithm> Drop for FlashSequencer<'_, A> {
    fn drop(&mut self) {
        if self.session.is_some() {
            tracing::warn!("Flash session was not finished, tearing it down.");
            if let Err(error) = self.close_session() {
                tracing::warn!("Failed to uninitialize the flash algorithm: {}", error);
            }
        }
    }
}
