use crate::serialize::{hex_option, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;

/// Register values every flash algorithm call starts with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SysCallParams {
    /// Return address of every call (LR). Points at the breakpoint
    /// instruction at the start of the blob, with the Thumb bit set.
    #[serde(with = "hex_u_int")]
    pub breakpoint: u32,
    /// Base of the data section the blob expects (R9).
    #[serde(with = "hex_u_int")]
    pub static_base: u32,
    /// Initial stack pointer (SP).
    #[serde(with = "hex_u_int")]
    pub stack_pointer: u32,
}

/// Per routine timeouts, in milliseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmTimeouts {
    /// Timeout of the `Init()` routine.
    pub init: u32,
    /// Timeout of the `UnInit()` routine.
    pub uninit: u32,
    /// Timeout of the `EraseChip()` routine.
    pub erase_chip: u32,
    /// Timeout of the `EraseSector()` routine.
    pub erase_sector: u32,
    /// Timeout of the `ProgramPage()` routine.
    pub program_page: u32,
}

impl Default for AlgorithmTimeouts {
    fn default() -> Self {
        Self {
            init: 2_000,
            uninit: 2_000,
            erase_chip: 30_000,
            erase_sector: 1_000,
            program_page: 500,
        }
    }
}

impl AlgorithmTimeouts {
    /// Timeout of the `Init()` routine.
    pub fn init(&self) -> Duration {
        Duration::from_millis(self.init as u64)
    }

    /// Timeout of the `UnInit()` routine.
    pub fn uninit(&self) -> Duration {
        Duration::from_millis(self.uninit as u64)
    }

    /// Timeout of the `EraseChip()` routine.
    pub fn erase_chip(&self) -> Duration {
        Duration::from_millis(self.erase_chip as u64)
    }

    /// Timeout of the `EraseSector()` routine.
    pub fn erase_sector(&self) -> Duration {
        Duration::from_millis(self.erase_sector as u64)
    }

    /// Timeout of the `ProgramPage()` routine.
    pub fn program_page(&self) -> Duration {
        Duration::from_millis(self.program_page as u64)
    }
}

fn default_min_write_size() -> u32 {
    4
}

fn default_erased_byte_value() -> u8 {
    0xff
}

/// The description of a flash algorithm blob and the fixed ABI used to call it.
///
/// The blob is copied to `algo_start` in target RAM. Every entry point is an
/// absolute address inside the copied blob. After each call the routine returns to
/// `sys_call.breakpoint`, where the target halts and the result is read from R0.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramTarget {
    /// The name of the flash algorithm.
    pub name: String,
    /// Address of the `Init()` entry point.
    #[serde(with = "hex_u_int")]
    pub init: u32,
    /// Address of the `UnInit()` entry point.
    #[serde(with = "hex_u_int")]
    pub uninit: u32,
    /// Address of the `EraseChip()` entry point, if the algorithm implements it.
    #[serde(default, with = "hex_option")]
    pub erase_chip: Option<u32>,
    /// Address of the `EraseSector()` entry point.
    #[serde(with = "hex_u_int")]
    pub erase_sector: u32,
    /// Address of the `ProgramPage()` entry point.
    #[serde(with = "hex_u_int")]
    pub program_page: u32,
    /// Address of the `Verify()` entry point. Optional.
    #[serde(default, with = "hex_option")]
    pub verify: Option<u32>,
    /// The register convention of every call.
    pub sys_call: SysCallParams,
    /// Address of the RAM buffer the page data is staged in.
    #[serde(with = "hex_u_int")]
    pub program_buffer: u32,
    /// Maximum number of bytes one `ProgramPage()` call writes.
    #[serde(with = "hex_u_int")]
    pub program_buffer_size: u32,
    /// Address the blob is copied to.
    #[serde(with = "hex_u_int")]
    pub algo_start: u32,
    /// The position independent machine code of the algorithm.
    #[serde(deserialize_with = "deserialize")]
    #[serde(serialize_with = "serialize")]
    pub algo_blob: Vec<u8>,
    /// Smallest unit of data the flash can be written with.
    #[serde(default = "default_min_write_size")]
    pub min_write_size: u32,
    /// The value of a byte in flash that was just erased.
    #[serde(default = "default_erased_byte_value")]
    pub erased_byte_value: u8,
    /// Per routine timeouts.
    #[serde(default)]
    pub timeouts: AlgorithmTimeouts,
}

impl ProgramTarget {
    /// Size of the blob in bytes.
    pub fn algo_size(&self) -> u32 {
        self.algo_blob.len() as u32
    }

    /// RAM occupied by the blob once loaded.
    pub fn algo_range(&self) -> Range<u32> {
        self.algo_start..self.algo_start.saturating_add(self.algo_size())
    }

    /// RAM occupied by the page staging buffer.
    pub fn program_buffer_range(&self) -> Range<u32> {
        self.program_buffer
            ..self
                .program_buffer
                .saturating_add(self.program_buffer_size)
    }

    /// Returns true if the algorithm can erase the whole flash in one call.
    pub fn supports_erase_chip(&self) -> bool {
        self.erase_chip.is_some()
    }
}

fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&base64::encode(bytes))
}

fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Base64Visitor;

    impl<'de> serde::de::Visitor<'de> for Base64Visitor {
        type Value = Vec<u8>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(formatter, "base64 ASCII text")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            // Long blobs are usually folded over several lines.
            let v: String = v.split_whitespace().collect();
            base64::decode(v).map_err(serde::de::Error::custom)
        }
    }

    deserializer.deserialize_str(Base64Visitor)
}
