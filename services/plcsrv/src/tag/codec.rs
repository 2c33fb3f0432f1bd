//! Packing and unpacking item values in a raw tag block
//!
//! Multi-byte values are little-endian. Booleans are single bits addressed by
//! the item's mask, so writes touch only their own bit.

use crate::error::{PlcError, Result};
use crate::store::TagValue;

use super::item::{ItemKind, TagItem};

fn slice<'a>(item: &TagItem, block: &'a [u8]) -> Result<&'a [u8]> {
    let range = item.footprint();
    block.get(range.clone()).ok_or_else(|| {
        PlcError::codec(format!(
            "item '{}' at bytes {:?} is outside a {}-byte block",
            item.name(),
            range,
            block.len()
        ))
    })
}

fn slice_mut<'a>(item: &TagItem, block: &'a mut [u8]) -> Result<&'a mut [u8]> {
    let range = item.footprint();
    let len = block.len();
    block.get_mut(range.clone()).ok_or_else(|| {
        PlcError::codec(format!(
            "item '{}' at bytes {:?} is outside a {}-byte block",
            item.name(),
            range,
            len
        ))
    })
}

/// Extract one item's value from a raw block
pub fn decode_item(item: &TagItem, block: &[u8]) -> Result<TagValue> {
    let bytes = slice(item, block)?;
    let value = match item.kind() {
        ItemKind::Boolean => TagValue::Bool(i32::from(bytes[0]) & item.bit_mask() != 0),
        ItemKind::Int8 => TagValue::Int(i64::from(bytes[0] as i8)),
        ItemKind::UInt8 => TagValue::Int(i64::from(bytes[0])),
        ItemKind::Int16 => TagValue::Int(i64::from(i16::from_le_bytes([bytes[0], bytes[1]]))),
        ItemKind::UInt16 => TagValue::Int(i64::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
        ItemKind::Int32 => TagValue::Int(i64::from(i32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        ItemKind::UInt32 => TagValue::Int(i64::from(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
        ItemKind::Real => TagValue::Real(f64::from(f32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))),
    };
    Ok(value)
}

/// Write one item's value into a raw block, leaving every other bit intact
pub fn encode_item(item: &TagItem, value: &TagValue, block: &mut [u8]) -> Result<()> {
    let value = item.check_value(value)?;
    let bytes = slice_mut(item, block)?;

    match (item.kind(), value) {
        (ItemKind::Boolean, TagValue::Bool(on)) => {
            // Mask is a single bit below 0x100
            let mask = item.bit_mask() as u8;
            if on {
                bytes[0] |= mask;
            } else {
                bytes[0] &= !mask;
            }
        },
        (ItemKind::Real, TagValue::Real(r)) => {
            bytes.copy_from_slice(&(r as f32).to_le_bytes());
        },
        (kind, TagValue::Int(v)) => match kind {
            ItemKind::Int8 | ItemKind::UInt8 => bytes[0] = v as u8,
            ItemKind::Int16 | ItemKind::UInt16 => {
                bytes.copy_from_slice(&(v as u16).to_le_bytes());
            },
            _ => bytes.copy_from_slice(&(v as u32).to_le_bytes()),
        },
        (kind, other) => {
            return Err(PlcError::codec(format!(
                "cannot encode '{}' as {}",
                other, kind
            )));
        },
    }
    Ok(())
}
