use crate::serialize::{hex_option, hex_u_int};
use crate::{FlashRegion, MemoryRange, ProgramTarget, RamRegion, SectorInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Source of a target description.
///
/// This is used for diagnostics, when
/// an error related to a target description occurs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetDescriptionSource {
    /// The target description was compiled into the crate.
    BuiltIn,
    /// The target description was loaded from an external source
    /// during runtime.
    External,
}

fn default_source() -> TargetDescriptionSource {
    TargetDescriptionSource::External
}

/// Reasons a target description is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetValidationError {
    /// The board id is not exactly four characters long.
    #[error("Board id '{0}' must be exactly four characters long.")]
    InvalidBoardId(String),
    /// The target does not describe any flash.
    #[error("Target '{0}' does not contain any flash region.")]
    NoFlashRegions(String),
    /// A region ends before it starts.
    #[error("Region {name:?} has an empty range {start:#010x}..{end:#010x}.")]
    EmptyRegion {
        /// The name of the region.
        name: Option<String>,
        /// The first address of the region.
        start: u32,
        /// The end of the region.
        end: u32,
    },
    /// A region has no sector table, and the target provides no fallback.
    #[error("Region {0:?} has no sector table.")]
    MissingSectorTable(Option<String>),
    /// The sector table is not strictly ascending.
    #[error("Sector table of region {name:?} is not ordered at {address:#010x}.")]
    UnorderedSectorTable {
        /// The name of the region.
        name: Option<String>,
        /// The offending sector table entry.
        address: u32,
    },
    /// A sector table entry lies outside its region.
    #[error("Sector {address:#010x} lies outside of region {name:?}.")]
    SectorOutsideRegion {
        /// The name of the region.
        name: Option<String>,
        /// The offending sector table entry.
        address: u32,
    },
    /// A sector table entry has a size of zero.
    #[error("Sector {address:#010x} of region {name:?} has a size of zero.")]
    ZeroSectorSize {
        /// The name of the region.
        name: Option<String>,
        /// The offending sector table entry.
        address: u32,
    },
    /// The sectors of a region do not end at the region end.
    #[error("The sectors of region {name:?} do not end at {end:#010x}; the last sector covers {remainder:#x} bytes only.")]
    SectorTableExtent {
        /// The name of the region.
        name: Option<String>,
        /// The declared end of the region.
        end: u32,
        /// The number of bytes of the region past the last complete sector.
        remainder: u32,
    },
    /// A sector can not be programmed with whole write units.
    #[error("Sector {address:#010x} of region {name:?} has a size of {size:#x} bytes, which is not a multiple of the minimum write size {min_write_size}.")]
    UnalignedSectorSize {
        /// The name of the region.
        name: Option<String>,
        /// The offending sector table entry.
        address: u32,
        /// The size of the sector.
        size: u32,
        /// The minimum write size of the region's algorithm.
        min_write_size: u32,
    },
    /// More than one region is flagged as default.
    #[error("Target '{0}' has more than one default region.")]
    MultipleDefaultRegions(String),
    /// Two regions overlap.
    #[error("Regions {0:?} and {1:?} overlap.")]
    OverlappingRegions(Option<String>, Option<String>),
    /// A region names an algorithm which does not exist.
    #[error("Region {region:?} uses unknown flash algorithm '{algorithm}'.")]
    UnknownAlgorithm {
        /// The name of the region.
        region: Option<String>,
        /// The algorithm name.
        algorithm: String,
    },
    /// Two algorithms have the same name.
    #[error("Flash algorithm '{0}' appears multiple times.")]
    DuplicateAlgorithm(String),
    /// The blob cannot be copied with word transfers.
    #[error("The blob of flash algorithm '{name}' has a length of {len} bytes, which is not a multiple of 4.")]
    UnalignedBlob {
        /// The algorithm name.
        name: String,
        /// The length of the blob.
        len: usize,
    },
    /// The algorithm would never halt after returning.
    #[error("The breakpoint {breakpoint:#010x} of flash algorithm '{name}' lies outside of its blob.")]
    BreakpointOutsideBlob {
        /// The algorithm name.
        name: String,
        /// The breakpoint address.
        breakpoint: u32,
    },
    /// An algorithm can not program anything.
    #[error("Flash algorithm '{0}' has a program buffer size of zero.")]
    ZeroProgramBuffer(String),
    /// A page can not be written with whole write units.
    #[error("The minimum write size {min_write_size} of flash algorithm '{name}' does not divide its program buffer size {program_buffer_size}.")]
    InvalidMinWriteSize {
        /// The algorithm name.
        name: String,
        /// The minimum write size.
        min_write_size: u32,
        /// The program buffer size.
        program_buffer_size: u32,
    },
}

/// The static description of one board: its flash layout, RAM and the flash algorithms
/// programming it.
///
/// A `TargetConfig` is immutable once it was normalized and validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    /// Four character board identifier.
    pub board_id: String,
    /// Human readable name of the board.
    pub name: String,
    /// Flash regions of the target, in lookup order.
    pub flash_regions: Vec<FlashRegion>,
    /// RAM regions of the target.
    #[serde(default)]
    pub ram_regions: Vec<RamRegion>,
    /// The flash algorithms the regions refer to.
    pub algorithms: Vec<ProgramTarget>,
    /// Uniform sector size for targets without sector tables.
    #[serde(default, with = "hex_option", skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u32>,
    /// Sector table shared by all regions without their own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sectors: Vec<SectorInfo>,
    /// Size of the virtual disc presented to the host.
    #[serde(with = "hex_u_int")]
    pub disc_size: u32,
    /// Reload the flash algorithm after a chip erase.
    #[serde(default)]
    pub erase_reset: bool,
    /// Web page of the board.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Source of the target description, used for diagnostics.
    #[serde(skip, default = "default_source")]
    pub source: TargetDescriptionSource,
}

impl TargetConfig {
    /// Create a new target from a YAML description.
    pub fn from_yaml_reader<R: std::io::Read>(reader: R) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(reader)
    }

    /// Write the target description as YAML.
    pub fn to_yaml_string(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Fills in empty region sector tables.
    ///
    /// A region without a sector table inherits the target wide `sectors`, restricted to the
    /// entries within the region. If there are none, a single entry of `sector_size` starting
    /// at the region start is used.
    pub fn normalize(&mut self) {
        for region in &mut self.flash_regions {
            if !region.sector_table.is_empty() {
                continue;
            }

            region.sector_table = self
                .sectors
                .iter()
                .filter(|s| region.contains(s.start))
                .copied()
                .collect();

            if region.sector_table.is_empty() {
                if let Some(size) = self.sector_size {
                    region.sector_table.push(SectorInfo {
                        start: region.start,
                        size,
                    });
                }
            }
        }
    }

    /// Validates the [`TargetConfig`] such that the flashing code can make assumptions about
    /// the correctness without validating thereafter.
    ///
    /// This method should be called right after the [`TargetConfig`] is created!
    pub fn validate(&self) -> Result<(), TargetValidationError> {
        if self.board_id.chars().count() != 4 {
            return Err(TargetValidationError::InvalidBoardId(self.board_id.clone()));
        }

        self.validate_algorithms()?;
        self.validate_flash_regions()?;

        Ok(())
    }

    fn validate_algorithms(&self) -> Result<(), TargetValidationError> {
        let mut seen = HashSet::new();

        for algorithm in &self.algorithms {
            if !seen.insert(&algorithm.name) {
                return Err(TargetValidationError::DuplicateAlgorithm(
                    algorithm.name.clone(),
                ));
            }

            if algorithm.algo_blob.len() % 4 != 0 {
                return Err(TargetValidationError::UnalignedBlob {
                    name: algorithm.name.clone(),
                    len: algorithm.algo_blob.len(),
                });
            }

            // The Thumb bit is set on the breakpoint.
            let breakpoint = algorithm.sys_call.breakpoint & !1;
            if !algorithm.algo_range().contains(&breakpoint) {
                return Err(TargetValidationError::BreakpointOutsideBlob {
                    name: algorithm.name.clone(),
                    breakpoint: algorithm.sys_call.breakpoint,
                });
            }

            if algorithm.program_buffer_size == 0 {
                return Err(TargetValidationError::ZeroProgramBuffer(
                    algorithm.name.clone(),
                ));
            }

            if algorithm.min_write_size == 0
                || algorithm.program_buffer_size % algorithm.min_write_size != 0
            {
                return Err(TargetValidationError::InvalidMinWriteSize {
                    name: algorithm.name.clone(),
                    min_write_size: algorithm.min_write_size,
                    program_buffer_size: algorithm.program_buffer_size,
                });
            }
        }

        Ok(())
    }

    fn validate_flash_regions(&self) -> Result<(), TargetValidationError> {
        if self.flash_regions.is_empty() {
            return Err(TargetValidationError::NoFlashRegions(self.name.clone()));
        }

        if self.flash_regions.iter().filter(|r| r.default).count() > 1 {
            return Err(TargetValidationError::MultipleDefaultRegions(
                self.name.clone(),
            ));
        }

        for (idx, region) in self.flash_regions.iter().enumerate() {
            if region.start >= region.end {
                return Err(TargetValidationError::EmptyRegion {
                    name: region.name.clone(),
                    start: region.start,
                    end: region.end,
                });
            }

            let Some(algorithm) = self.algorithm_for(region) else {
                return Err(TargetValidationError::UnknownAlgorithm {
                    region: region.name.clone(),
                    algorithm: region.algorithm.clone(),
                });
            };

            validate_sector_table(region)?;

            if let Some(entry) = region
                .sector_table
                .iter()
                .find(|entry| entry.size % algorithm.min_write_size != 0)
            {
                return Err(TargetValidationError::UnalignedSectorSize {
                    name: region.name.clone(),
                    address: entry.start,
                    size: entry.size,
                    min_write_size: algorithm.min_write_size,
                });
            }

            for other in &self.flash_regions[idx + 1..] {
                if region.range().intersects_range(&other.range()) {
                    return Err(TargetValidationError::OverlappingRegions(
                        region.name.clone(),
                        other.name.clone(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Returns the flash algorithm which programs `region`.
    pub fn algorithm_for(&self, region: &FlashRegion) -> Option<&ProgramTarget> {
        self.algorithms
            .iter()
            .find(|algorithm| algorithm.name == region.algorithm)
    }

    /// Returns the region flagged as default, if any.
    pub fn default_region(&self) -> Option<&FlashRegion> {
        self.flash_regions.iter().find(|r| r.default)
    }
}

fn validate_sector_table(region: &FlashRegion) -> Result<(), TargetValidationError> {
    let name = || region.name.clone();

    let Some(last) = region.sector_table.last() else {
        return Err(TargetValidationError::MissingSectorTable(name()));
    };

    let mut previous: Option<&SectorInfo> = None;
    for entry in &region.sector_table {
        if !region.contains(entry.start) {
            return Err(TargetValidationError::SectorOutsideRegion {
                name: name(),
                address: entry.start,
            });
        }

        if entry.size == 0 {
            return Err(TargetValidationError::ZeroSectorSize {
                name: name(),
                address: entry.start,
            });
        }

        if let Some(previous) = previous {
            // Each entry must start on a sector boundary of the one before it.
            if entry.start <= previous.start || (entry.start - previous.start) % previous.size != 0
            {
                return Err(TargetValidationError::UnorderedSectorTable {
                    name: name(),
                    address: entry.start,
                });
            }
        }
        previous = Some(entry);
    }

    if region.sector_table[0].start != region.start {
        return Err(TargetValidationError::SectorOutsideRegion {
            name: name(),
            address: region.start,
        });
    }

    let remainder = (region.end - last.start) % last.size;
    if remainder != 0 {
        return Err(TargetValidationError::SectorTableExtent {
            name: name(),
            end: region.end,
            remainder,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::SysCallParams;
    use pretty_assertions::assert_eq;

    fn algorithm(name: &str) -> ProgramTarget {
        ProgramTarget {
            name: name.to_string(),
            init: 0x2000_0021,
            uninit: 0x2000_0031,
            erase_chip: Some(0x2000_0041),
            erase_sector: 0x2000_0051,
            program_page: 0x2000_0061,
            verify: None,
            sys_call: SysCallParams {
                breakpoint: 0x2000_0001,
                static_base: 0x2000_0400,
                stack_pointer: 0x2000_1000,
            },
            program_buffer: 0x2000_1000,
            program_buffer_size: 0x400,
            algo_start: 0x2000_0000,
            algo_blob: vec![0x00, 0xbe, 0x0a, 0xe0, 0, 0, 0, 0],
            min_write_size: 4,
            erased_byte_value: 0xff,
            timeouts: Default::default(),
        }
    }

    fn target() -> TargetConfig {
        TargetConfig {
            board_id: "1234".to_string(),
            name: "test".to_string(),
            flash_regions: vec![FlashRegion {
                name: Some("flash".to_string()),
                start: 0x0,
                end: 0x1_0000,
                sector_table: vec![],
                algorithm: "algo".to_string(),
                default: true,
                is_alias: false,
            }],
            ram_regions: vec![],
            algorithms: vec![algorithm("algo")],
            sector_size: Some(0x400),
            sectors: vec![],
            disc_size: 0x1_0000,
            erase_reset: false,
            url: None,
            source: TargetDescriptionSource::BuiltIn,
        }
    }

    #[test]
    fn normalize_uses_uniform_sector_size() {
        let mut target = target();
        target.normalize();

        assert_eq!(
            target.flash_regions[0].sector_table,
            vec![SectorInfo {
                start: 0x0,
                size: 0x400
            }]
        );
        assert_eq!(target.validate(), Ok(()));
    }

    #[test]
    fn normalize_prefers_target_sectors() {
        let mut target = target();
        target.sectors = vec![
            SectorInfo {
                start: 0x0,
                size: 0x400,
            },
            SectorInfo {
                start: 0x8000,
                size: 0x1000,
            },
            SectorInfo {
                start: 0x2000_0000,
                size: 0x1000,
            },
        ];
        target.normalize();

        assert_eq!(target.flash_regions[0].sector_table, target.sectors[..2]);
        assert_eq!(target.validate(), Ok(()));
    }

    #[test]
    fn missing_sector_table() {
        let mut target = target();
        target.sector_size = None;
        target.normalize();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::MissingSectorTable(Some(
                "flash".to_string()
            )))
        );
    }

    #[test]
    fn sector_table_must_reach_region_end() {
        let mut target = target();
        target.flash_regions[0].end = 0x1_0200;
        target.normalize();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::SectorTableExtent {
                name: Some("flash".to_string()),
                end: 0x1_0200,
                remainder: 0x200,
            })
        );
    }

    #[test]
    fn unordered_sector_table() {
        let mut target = target();
        target.flash_regions[0].sector_table = vec![
            SectorInfo {
                start: 0x0,
                size: 0x400,
            },
            SectorInfo {
                start: 0x0,
                size: 0x800,
            },
        ];

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::UnorderedSectorTable {
                name: Some("flash".to_string()),
                address: 0x0,
            })
        );
    }

    #[test]
    fn sector_entry_outside_region() {
        let mut target = target();
        target.flash_regions[0].sector_table = vec![
            SectorInfo {
                start: 0x0,
                size: 0x400,
            },
            SectorInfo {
                start: 0x1_0000,
                size: 0x800,
            },
        ];

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::SectorOutsideRegion {
                name: Some("flash".to_string()),
                address: 0x1_0000,
            })
        );
    }

    #[test]
    fn unknown_algorithm() {
        let mut target = target();
        target.normalize();
        target.flash_regions[0].algorithm = "other".to_string();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::UnknownAlgorithm {
                region: Some("flash".to_string()),
                algorithm: "other".to_string(),
            })
        );
    }

    #[test]
    fn overlapping_regions() {
        let mut target = target();
        let mut second = target.flash_regions[0].clone();
        second.name = Some("second".to_string());
        second.start = 0x8000;
        second.end = 0x1_8000;
        second.default = false;
        target.flash_regions.push(second);
        target.normalize();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::OverlappingRegions(
                Some("flash".to_string()),
                Some("second".to_string())
            ))
        );
    }

    #[test]
    fn multiple_default_regions() {
        let mut target = target();
        let mut second = target.flash_regions[0].clone();
        second.start = 0x1_0000;
        second.end = 0x2_0000;
        target.flash_regions.push(second);
        target.normalize();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::MultipleDefaultRegions(
                "test".to_string()
            ))
        );
    }

    #[test]
    fn algorithm_checks() {
        let mut target = target();
        target.normalize();

        target.algorithms[0].algo_blob.push(0);
        assert!(matches!(
            target.validate(),
            Err(TargetValidationError::UnalignedBlob { len: 9, .. })
        ));

        target.algorithms[0] = algorithm("algo");
        target.algorithms[0].sys_call.breakpoint = 0x2000_0101;
        assert!(matches!(
            target.validate(),
            Err(TargetValidationError::BreakpointOutsideBlob { .. })
        ));

        target.algorithms[0] = algorithm("algo");
        target.algorithms[0].min_write_size = 0x300;
        assert!(matches!(
            target.validate(),
            Err(TargetValidationError::InvalidMinWriteSize { .. })
        ));

        target.algorithms[0] = algorithm("algo");
        target.algorithms[0].min_write_size = 0x800;
        target.algorithms[0].program_buffer_size = 0x800;
        assert_eq!(
            target.validate(),
            Err(TargetValidationError::UnalignedSectorSize {
                name: Some("flash".to_string()),
                address: 0x0,
                size: 0x400,
                min_write_size: 0x800
            })
        );

        target.algorithms[0] = algorithm("algo");
        target.flash_regions[0].sector_table = vec![SectorInfo {
            start: 0x0,
            size: 0x102,
        }];
        target.flash_regions[0].end = 0x102 * 4;
        assert!(matches!(
            target.validate(),
            Err(TargetValidationError::UnalignedSectorSize { size: 0x102, .. })
        ));

        target.flash_regions[0].sector_table = vec![SectorInfo {
            start: 0x0,
            size: 0x400,
        }];
        target.flash_regions[0].end = 0x1_0000;
        target.algorithms[0].program_buffer_size = 0;
        assert_eq!(
            target.validate(),
            Err(TargetValidationError::ZeroProgramBuffer("algo".to_string()))
        );

        target.algorithms = vec![algorithm("algo"), algorithm("algo")];
        assert_eq!(
            target.validate(),
            Err(TargetValidationError::DuplicateAlgorithm("algo".to_string()))
        );
    }

    #[test]
    fn invalid_board_id() {
        let mut target = target();
        target.board_id = "12345".to_string();
        target.normalize();

        assert_eq!(
            target.validate(),
            Err(TargetValidationError::InvalidBoardId("12345".to_string()))
        );
    }

    #[test]
    fn yaml_round_trip() {
        let mut target = target();
        target.normalize();

        let yaml = target.to_yaml_string().unwrap();
        assert!(yaml.contains("0x10000"), "{yaml}");

        let parsed = TargetConfig::from_yaml_reader(yaml.as_bytes()).unwrap();
        assert_eq!(parsed.flash_regions, target.flash_regions);
        assert_eq!(parsed.algorithms, target.algorithms);
        assert_eq!(parsed.source, TargetDescriptionSource::External);
    }
}
