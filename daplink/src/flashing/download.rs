use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
    str::FromStr,
};

use super::{FlashAlgorithm, FlashError, FlashSequencer, ProgramError};
use ihex::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extended options for flashing a binary file.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BinOptions {
    /// The address in flash where the binary will be put at.
    ///
    /// Defaults to the start of the default flash region of the target.
    pub base_address: Option<u32>,
    /// The number of bytes to skip at the start of the binary file.
    pub skip: u32,
}

/// The file formats which can be downloaded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Format {
    /// The file contains the contents of the flash 1:1.
    Bin(BinOptions),
    /// Marks a file in [Intel HEX](https://en.wikipedia.org/wiki/Intel_HEX) format.
    Hex,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &s.to_lowercase()[..] {
            "bin" | "binary" => Ok(Format::Bin(BinOptions::default())),
            "hex" | "ihex" | "intelhex" => Ok(Format::Hex),
            _ => Err(format!("Format '{s}' is unknown.")),
        }
    }
}

/// A finite list of all the errors that can occur when flashing a given file.
#[derive(Debug, Error)]
pub enum FileDownloadError {
    /// Programming the flash failed.
    #[error("Error while programming")]
    Program(#[from] ProgramError),
    /// Committing the programmed data failed.
    #[error("Error while flashing")]
    Flash(#[from] FlashError),
    /// Reading and decoding the IHEX file has failed due to the given error.
    #[error("Could not read ihex format")]
    IhexRead(#[from] ihex::ReaderError),
    /// An IO error has occured while reading the firmware file.
    #[error("I/O error")]
    IO(#[from] std::io::Error),
    /// A binary file was given, but neither the options nor the target name an address for it.
    #[error("No base address is known for the binary file.")]
    NoBaseAddress,
}

/// Downloads a file of given `format` at `path` through `sequencer` and finishes the session.
pub fn download_file<A: FlashAlgorithm>(
    sequencer: &mut FlashSequencer<'_, A>,
    path: &Path,
    format: Format,
) -> Result<(), FileDownloadError> {
    let mut file = File::open(path)?;

    match format {
        Format::Bin(options) => download_bin(sequencer, &mut file, options),
        Format::Hex => {
            let mut data = String::new();
            file.read_to_string(&mut data)?;
            download_hex(sequencer, &data)
        }
    }
}

/// Downloads the contents of a binary file.
pub fn download_bin<A: FlashAlgorithm, T: Read + Seek>(
    sequencer: &mut FlashSequencer<'_, A>,
    file: &mut T,
    options: BinOptions,
) -> Result<(), FileDownloadError> {
    let target = sequencer.target();
    let address = options
        .base_address
        .or_else(|| target.default_region().map(|region| region.start))
        .or_else(|| target.flash_regions.first().map(|region| region.start))
        .ok_or(FileDownloadError::NoBaseAddress)?;

    // Skip the specified bytes.
    file.seek(SeekFrom::Start(u64::from(options.skip)))?;

    let mut buffer = vec![];
    file.read_to_end(&mut buffer)?;

    tracing::info!(
        "Downloading {} bytes of binary data to {:#010x}",
        buffer.len(),
        address
    );
    sequencer.download(address, &buffer)?;

    Ok(())
}

/// Downloads the contents of an Intel HEX file.
///
/// Records are sorted by address and contiguous records are programmed as one block.
pub fn download_hex<A: FlashAlgorithm>(
    sequencer: &mut FlashSequencer<'_, A>,
    data: &str,
) -> Result<(), FileDownloadError> {
    let mut extended_segment_address = 0;
    let mut extended_linear_address = 0;
    let mut blocks: Vec<(u32, Vec<u8>)> = vec![];

    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                let address = extended_linear_address + extended_segment_address + offset as u32;
                blocks.push((address, value));
            }
            Record::EndOfFile => (),
            Record::ExtendedSegmentAddress(address) => {
                extended_segment_address = address as u32 * 16;
            }
            Record::StartSegmentAddress { .. } => (),
            Record::ExtendedLinearAddress(address) => {
                extended_linear_address = (address as u32) << 16;
            }
            Record::StartLinearAddress(_) => (),
        };
    }

    for (address, data) in coalesce(blocks) {
        tracing::debug!("Programming {} bytes at {:#010x}", data.len(), address);
        sequencer.program(address, &data)?;
    }

    sequencer.finish()?;

    Ok(())
}

fn coalesce(mut blocks: Vec<(u32, Vec<u8>)>) -> Vec<(u32, Vec<u8>)> {
    blocks.sort_by_key(|(address, _)| *address);

    let mut merged: Vec<(u32, Vec<u8>)> = vec![];
    for (address, data) in blocks {
        match merged.last_mut() {
            Some((start, existing)) if *start as u64 + existing.len() as u64 == address as u64 => {
                existing.extend_from_slice(&data);
            }
            _ => merged.push((address, data)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::flashing::{SequencerOptions, SimulatedFlash};
    use daplink_target::Registry;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_format() {
        assert_eq!(Format::from_str("hex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("IHex"), Ok(Format::Hex));
        assert_eq!(Format::from_str("IntelHex"), Ok(Format::Hex));
        assert_eq!(
            Format::from_str("binary"),
            Ok(Format::Bin(BinOptions {
                base_address: None,
                skip: 0
            }))
        );
        assert!(Format::from_str("elf").is_err());
    }

    #[test]
    fn coalesces_contiguous_blocks() {
        let blocks = vec![(0x10, vec![3, 4]), (0x0, vec![1]), (0xe, vec![1, 2])];
        assert_eq!(
            coalesce(blocks),
            vec![(0x0, vec![1]), (0xe, vec![1, 2, 3, 4])]
        );
    }

    #[test]
    fn hex_with_extended_linear_address() {
        let hex = ihex::create_object_file_representation(&[
            Record::ExtendedLinearAddress(0x0800),
            Record::Data {
                offset: 0x0004,
                value: vec![5, 6, 7, 8],
            },
            Record::Data {
                offset: 0x0000,
                value: vec![1, 2, 3, 4],
            },
            Record::EndOfFile,
        ])
        .unwrap();

        let registry = Registry::from_builtin_boards();
        let target = registry.get_target_by_board_id("0826").unwrap();
        let mut flash = SimulatedFlash::for_target(target);
        let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());

        download_hex(&mut sequencer, &hex).unwrap();
        drop(sequencer);

        assert_eq!(flash.programmed_pages(), &[(0x0800_0000, 8)]);
        assert_eq!(
            flash.contents(0x0800_0000, 8),
            vec![1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(flash.counters().finish, 1);
    }

    #[test]
    fn bin_defaults_to_default_region() {
        let registry = Registry::from_builtin_boards();
        let target = registry.get_target_by_board_id("0826").unwrap();
        let mut flash = SimulatedFlash::for_target(target);
        let mut sequencer = FlashSequencer::new(target, &mut flash, SequencerOptions::default());

        let mut file = std::io::Cursor::new(vec![0xaa, 0xbb, 1, 2, 3, 4]);
        download_bin(
            &mut sequencer,
            &mut file,
            BinOptions {
                base_address: None,
                skip: 2,
            },
        )
        .unwrap();
        drop(sequencer);

        assert_eq!(flash.contents(0x0800_0000, 4), vec![1, 2, 3, 4]);
    }
}
