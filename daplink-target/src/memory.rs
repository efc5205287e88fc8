use crate::serialize::hex_u_int;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One entry of a flash sector table.
///
/// Starting at the absolute flash address `start`, all following sectors have
/// a size of `size`. This is valid until either the end of the owning
/// [`FlashRegion`], or until the next `SectorInfo` changes the sector size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorInfo {
    /// Absolute start address of the group of sectors.
    #[serde(with = "hex_u_int")]
    pub start: u32,
    /// Size of each individual sector of the group.
    #[serde(with = "hex_u_int")]
    pub size: u32,
}

/// Holds information about a specific, individual flash sector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Sector {
    /// Base address of the flash sector
    pub start: u32,
    /// Size of the flash sector
    pub size: u32,
}

impl Sector {
    /// Returns the address range of the sector.
    pub fn address_range(&self) -> Range<u32> {
        self.start..self.end()
    }

    /// First address after the sector.
    ///
    /// Saturates for a sector ending at the very top of the 32 bit address space.
    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.size)
    }

    /// Returns true if `address` lies within the sector.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && address - self.start < self.size
    }
}

/// A contiguous range of flash serviced by one flash algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashRegion {
    /// A name to describe the region
    #[serde(default)]
    pub name: Option<String>,
    /// First address of the region.
    #[serde(with = "hex_u_int")]
    pub start: u32,
    /// First address after the region.
    #[serde(with = "hex_u_int")]
    pub end: u32,
    /// Sector geometry of the region, ordered by ascending start address.
    #[serde(default)]
    pub sector_table: Vec<SectorInfo>,
    /// Name of the [`ProgramTarget`](crate::ProgramTarget) which programs this region.
    pub algorithm: String,
    /// Selected for addresses that no region contains.
    #[serde(default)]
    pub default: bool,
    /// True if the region is an alias of a different flash region.
    #[serde(default)]
    pub is_alias: bool,
}

impl FlashRegion {
    /// Address range of the region.
    pub fn range(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Returns whether the region contains the given address.
    pub fn contains(&self, address: u32) -> bool {
        self.range().contains(&address)
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u32 {
        self.end - self.start
    }

    /// Returns the sector table entry which describes `address`.
    ///
    /// This is the entry with the greatest start address which is not above `address`.
    /// The region bounds are not checked, so the last entry also answers for addresses
    /// at or beyond the end of the region.
    pub fn sector_info(&self, address: u32) -> Option<&SectorInfo> {
        self.sector_table.iter().rfind(|s| s.start <= address)
    }

    /// Try to retrieve the sector which contains `address`.
    ///
    /// Like [`FlashRegion::sector_info`], this does not check the region bounds.
    pub fn sector_at(&self, address: u32) -> Option<Sector> {
        let info = self.sector_info(address)?;
        if info.size == 0 {
            return None;
        }

        let sector_index = (address - info.start) / info.size;

        Some(Sector {
            start: info.start + sector_index * info.size,
            size: info.size,
        })
    }

    /// Iterate over all the sectors of the region.
    pub fn sectors(&self) -> impl Iterator<Item = Sector> + '_ {
        let mut address = self.sector_table.first().map(|s| s.start).unwrap_or(self.end);
        let mut desc_idx = 0;
        std::iter::from_fn(move || {
            if address >= self.end {
                return None;
            }

            // Advance desc_idx if needed
            if let Some(next_desc) = self.sector_table.get(desc_idx + 1) {
                if next_desc.start <= address {
                    desc_idx += 1;
                }
            }

            let size = self.sector_table[desc_idx].size;
            if size == 0 {
                return None;
            }

            let sector = Sector {
                start: address,
                size,
            };
            address = address.saturating_add(size);

            Some(sector)
        })
    }
}

/// Represents a region in RAM the flash algorithm may use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamRegion {
    /// A name to describe the region
    #[serde(default)]
    pub name: Option<String>,
    /// First address of the region.
    #[serde(with = "hex_u_int")]
    pub start: u32,
    /// First address after the region.
    #[serde(with = "hex_u_int")]
    pub end: u32,
}

impl RamRegion {
    /// Address range of the region.
    pub fn range(&self) -> Range<u32> {
        self.start..self.end
    }

    /// Returns whether the region contains the given address range entirely.
    pub fn contains_range(&self, range: &Range<u32>) -> bool {
        self.range().contains_range(range)
    }
}

/// Enables the user to do range intersection testing.
pub trait MemoryRange {
    /// Returns true if `self` contains `range` fully.
    fn contains_range(&self, range: &Range<u32>) -> bool;

    /// Returns true if `self` intersects `range` partially.
    fn intersects_range(&self, range: &Range<u32>) -> bool;
}

impl MemoryRange for Range<u32> {
    fn contains_range(&self, range: &Range<u32>) -> bool {
        if range.end == 0 {
            false
        } else {
            self.contains(&range.start) && self.contains(&(range.end - 1))
        }
    }

    fn intersects_range(&self, range: &Range<u32>) -> bool {
        if range.end == 0 || range.is_empty() || self.is_empty() {
            false
        } else {
            self.start < range.end && range.start < self.end
        }
    }
}
