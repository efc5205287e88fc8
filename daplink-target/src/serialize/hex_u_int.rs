use serde::{self, Deserializer, Serializer};

/// Serializes an address or size as a hex string in human-readable formats such as YAML.
pub(crate) fn serialize<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(format!("{value:#x}").as_str())
    } else {
        serializer.serialize_u32(*value)
    }
}

/// Accepts plain integers as well as `0x` prefixed hex strings.
pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(HexVisitor)
}

pub(crate) struct HexVisitor;

impl<'de> serde::de::Visitor<'de> for HexVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a 32 bit unsigned integer or a hex string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u32::try_from(v).map_err(|_| E::custom(format!("{v:#x} does not fit into 32 bits")))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u32::try_from(v).map_err(|_| E::custom(format!("{v} is not a valid 32 bit address")))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        parse_u32(v).ok_or_else(|| E::custom(format!("'{v}' is not a valid 32 bit number")))
    }
}

pub(crate) fn parse_u32(v: &str) -> Option<u32> {
    let v = v.trim().replace('_', "");
    match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => v.parse().ok(),
    }
}
