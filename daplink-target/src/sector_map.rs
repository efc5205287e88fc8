//! Erase granularity lookups over the flash regions of a target.
//!
//! All lookups scan the regions in table order. The first region which contains
//! the address wins; if none does, the region flagged as `default` answers instead.

use crate::{FlashRegion, Sector};

/// Errors of the sector map lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SectorMapError {
    /// The address matches no region, and no default region exists.
    #[error("Address {address:#010x} is not contained in any flash region.")]
    AddressOutOfRange {
        /// The address which was looked up.
        address: u32,
    },
}

/// Selects the region that services `address`.
///
/// Returns the first region containing the address, else the default region.
pub fn region_for_address(regions: &[FlashRegion], address: u32) -> Option<&FlashRegion> {
    regions
        .iter()
        .find(|region| region.contains(address))
        .or_else(|| {
            let default = regions.iter().find(|region| region.default);
            if let Some(region) = default {
                tracing::trace!(
                    "Address {:#010x} not contained in any region, using default region {:?}",
                    address,
                    region.name
                );
            }
            default
        })
}

/// Returns the sector which contains `address`.
pub fn sector_at(regions: &[FlashRegion], address: u32) -> Result<Sector, SectorMapError> {
    region_for_address(regions, address)
        .and_then(|region| region.sector_at(address))
        .ok_or(SectorMapError::AddressOutOfRange { address })
}

/// Returns the erase granularity at `address`.
pub fn sector_size_at(regions: &[FlashRegion], address: u32) -> Result<u32, SectorMapError> {
    region_for_address(regions, address)
        .and_then(|region| region.sector_info(address))
        .filter(|info| info.size > 0)
        .map(|info| info.size)
        .ok_or(SectorMapError::AddressOutOfRange { address })
}

/// Rounds `address` down to the start of its enclosing sector.
pub fn sector_start_at(regions: &[FlashRegion], address: u32) -> Result<u32, SectorMapError> {
    sector_at(regions, address).map(|sector| sector.start)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SectorInfo;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn region(start: u32, end: u32, sectors: &[(u32, u32)], default: bool) -> FlashRegion {
        FlashRegion {
            name: Some(format!("{start:#x}")),
            start,
            end,
            sector_table: sectors
                .iter()
                .map(|&(start, size)| SectorInfo { start, size })
                .collect(),
            algorithm: "algo".to_string(),
            default,
            is_alias: false,
        }
    }

    /// Internal flash with small and large sectors, plus an external flash.
    fn regions(with_default: bool) -> Vec<FlashRegion> {
        vec![
            region(
                0x0800_0000,
                0x0808_0000,
                &[
                    (0x0800_0000, 0x4000),
                    (0x0801_0000, 0x1_0000),
                    (0x0802_0000, 0x2_0000),
                ],
                with_default,
            ),
            region(0x9000_0000, 0x9100_0000, &[(0x9000_0000, 0x1000)], false),
        ]
    }

    #[test_case(0x0800_0000, 0x4000, 0x0800_0000; "first small sector")]
    #[test_case(0x0800_7fff, 0x4000, 0x0800_4000; "end of second small sector")]
    #[test_case(0x0801_0000, 0x1_0000, 0x0801_0000; "medium sector")]
    #[test_case(0x0803_0004, 0x2_0000, 0x0802_0000; "large sector")]
    #[test_case(0x0807_ffff, 0x2_0000, 0x0806_0000; "last byte of internal flash")]
    #[test_case(0x9000_1234, 0x1000, 0x9000_1000; "external flash")]
    fn lookup(address: u32, size: u32, start: u32) {
        let regions = regions(false);
        assert_eq!(sector_size_at(&regions, address), Ok(size));
        assert_eq!(sector_start_at(&regions, address), Ok(start));
    }

    #[test]
    fn out_of_range_without_default() {
        let regions = regions(false);
        for address in [0x0, 0x0808_0000, 0x8fff_ffff, 0x9100_0000, 0xffff_ffff] {
            assert_eq!(
                sector_size_at(&regions, address),
                Err(SectorMapError::AddressOutOfRange { address })
            );
            assert_eq!(
                sector_start_at(&regions, address),
                Err(SectorMapError::AddressOutOfRange { address })
            );
        }
    }

    #[test]
    fn default_region_answers_off_by_one_requests() {
        let regions = regions(true);

        // One past the end of internal flash falls back to the default region's last entry.
        assert_eq!(sector_size_at(&regions, 0x0808_0000), Ok(0x2_0000));
        assert_eq!(sector_start_at(&regions, 0x0808_0000), Ok(0x0808_0000));

        // Below the default region's sector table there is nothing to answer with.
        assert_eq!(
            sector_size_at(&regions, 0x100),
            Err(SectorMapError::AddressOutOfRange { address: 0x100 })
        );

        // A region that explicitly contains the address still wins over the default.
        assert_eq!(
            region_for_address(&regions, 0x9000_0000).map(|r| r.start),
            Some(0x9000_0000)
        );
    }

    #[test]
    fn first_matching_region_wins() {
        let regions = vec![
            region(0x0, 0x1000, &[(0x0, 0x400)], false),
            region(0x800, 0x2000, &[(0x800, 0x800)], false),
        ];

        assert_eq!(sector_size_at(&regions, 0xc00), Ok(0x400));
        assert_eq!(sector_size_at(&regions, 0x1000), Ok(0x800));
    }

    #[test]
    fn start_and_size_agree_for_every_address() {
        let regions = vec![
            region(
                0x0,
                0x1_0000,
                &[(0x0, 0x400), (0x1000, 0x1000), (0x8000, 0x2000)],
                false,
            ),
            region(0x2000_0000, 0x2000_3000, &[(0x2000_0000, 0x300)], false),
        ];

        for region in &regions {
            for address in (region.start..region.end).step_by(0x7f) {
                let start = sector_start_at(&regions, address).unwrap();
                let size = sector_size_at(&regions, address).unwrap();
                assert!(start <= address, "{start:#x} > {address:#x}");
                assert!(start + size > address, "{start:#x} + {size:#x} <= {address:#x}");
            }
        }
    }
}
