use std::ops::Range;
use std::time::Duration;

/// A structure to manage the flashing procedure progress reporting.
///
/// This struct stores a handler closure which will be called everytime an event happens during the flashing process.
///
/// # Example
///
/// ```
/// use daplink::flashing::FlashProgress;
///
/// // Print events
/// let progress = FlashProgress::new(|event| println!("Event: {:#?}", event));
/// ```
pub struct FlashProgress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl FlashProgress {
    /// Create a new `FlashProgress` structure with a given `handler` to be called on events.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Create a new `FlashProgress` structure which ignores all events.
    pub fn empty() -> Self {
        Self::new(|_| {})
    }

    /// Emit a flashing progress event.
    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    pub(super) fn session_started(&self, region: Range<u32>) {
        self.emit(ProgressEvent::SessionStarted { region });
    }

    pub(super) fn sector_erased(&self, address: u32, size: u32, time: Duration) {
        self.emit(ProgressEvent::SectorErased {
            address,
            size,
            time,
        });
    }

    pub(super) fn page_programmed(&self, address: u32, size: u32, time: Duration) {
        self.emit(ProgressEvent::PageProgrammed {
            address,
            size,
            time,
        });
    }

    pub(super) fn chip_erased(&self, region: Range<u32>, time: Duration) {
        self.emit(ProgressEvent::ChipErased { region, time });
    }

    pub(super) fn session_finished(&self) {
        self.emit(ProgressEvent::SessionFinished);
    }

    pub(super) fn failed(&self, address: u32) {
        self.emit(ProgressEvent::Failed { address });
    }
}

impl Default for FlashProgress {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for FlashProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashProgress").finish_non_exhaustive()
    }
}

/// Possible events during the flashing process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The flash algorithm was loaded and initialized for a region.
    SessionStarted {
        /// The address range of the region.
        region: Range<u32>,
    },
    /// A sector was erased.
    SectorErased {
        /// The start of the sector.
        address: u32,
        /// The size of the sector.
        size: u32,
        /// The time it took to erase the sector.
        time: Duration,
    },
    /// A page was programmed.
    PageProgrammed {
        /// The address of the page.
        address: u32,
        /// The number of bytes written, including padding.
        size: u32,
        /// The time it took to program the page.
        time: Duration,
    },
    /// A region was erased with one chip erase call.
    ChipErased {
        /// The address range of the region.
        region: Range<u32>,
        /// The time it took to erase.
        time: Duration,
    },
    /// The session was closed successfully.
    SessionFinished,
    /// Flashing failed.
    Failed {
        /// The address of the failing operation.
        address: u32,
    },
}
