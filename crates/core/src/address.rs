//! Real-mode address helpers.
//!
//! The debug stub works on flat linear addresses. Addresses discovered in a
//! DOS debugger are usually written as `segment:offset`, so both notations are
//! accepted wherever a caller types an address.

use serde::{de, Deserialize, Deserializer};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("segment {0:?} does not fit in 16 bits")]
    SegmentOutOfRange(String),
    #[error("offset {0:?} does not fit in 16 bits")]
    OffsetOutOfRange(String),
}

/// `(segment << 4) + offset`
pub fn seg_offset_to_linear(segment: u16, offset: u16) -> u32 {
    ((segment as u32) << 4) + offset as u32
}

/// Canonical real-mode form with the offset in 0x0..=0xF.
///
/// Linear addresses above 1 MiB have no canonical segment form; their
/// segment wraps to 16 bits.
pub fn linear_to_seg_offset(linear: u32) -> (u16, u16) {
    (((linear >> 4) & 0xFFFF) as u16, (linear & 0xF) as u16)
}

pub fn format_seg_off(segment: u16, offset: u16) -> String {
    format!("{:04X}:{:04X}", segment, offset)
}

/// Parse `SSSS:OOOO` (both hex) or a linear number (`0x` hex, or decimal).
pub fn parse_address(text: &str) -> Result<u32, AddressError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AddressError::Empty);
    }

    if let Some((seg, off)) = text.split_once(':') {
        let segment = u32::from_str_radix(seg.trim(), 16)
            .map_err(|_| AddressError::InvalidNumber(seg.to_string()))?;
        let offset = u32::from_str_radix(off.trim(), 16)
            .map_err(|_| AddressError::InvalidNumber(off.to_string()))?;
        let segment =
            u16::try_from(segment).map_err(|_| AddressError::SegmentOutOfRange(seg.to_string()))?;
        let offset =
            u16::try_from(offset).map_err(|_| AddressError::OffsetOutOfRange(off.to_string()))?;
        return Ok(seg_offset_to_linear(segment, offset));
    }

    parse_number(text)
}

/// Parse a size or plain number, `0x` hex or decimal.
pub fn parse_number(text: &str) -> Result<u32, AddressError> {
    let text = text.trim();
    let parsed = match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| AddressError::InvalidNumber(text.to_string()))
}

/// Serde helper: accept an address as a JSON number or as a string in any
/// form [`parse_address`] understands.
pub fn deserialize_address<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(AddressVisitor)
}

/// Same as [`deserialize_address`] for an optional field.
pub fn deserialize_optional_address<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "deserialize_address")] u32);

    Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(address)| address))
}

struct AddressVisitor;

impl<'de> de::Visitor<'de> for AddressVisitor {
    type Value = u32;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a linear address number or a \"0x...\" / \"SSSS:OOOO\" string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u32, E> {
        u32::try_from(v).map_err(|_| E::custom(format!("address {:#x} exceeds 32 bits", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u32, E> {
        u32::try_from(v).map_err(|_| E::custom(format!("address {} out of range", v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u32, E> {
        parse_address(v).map_err(E::custom)
    }
}
