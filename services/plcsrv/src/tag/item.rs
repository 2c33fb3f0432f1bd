//! Typed items within a tag's memory block

use std::ops::Range;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlcError, Result};
use crate::store::TagValue;

/// Declared value kind of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ItemKind {
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Real,
}

impl ItemKind {
    /// Bytes occupied in the raw block (a boolean occupies part of one byte)
    pub fn width(&self) -> usize {
        match self {
            ItemKind::Boolean | ItemKind::Int8 | ItemKind::UInt8 => 1,
            ItemKind::Int16 | ItemKind::UInt16 => 2,
            ItemKind::Int32 | ItemKind::UInt32 | ItemKind::Real => 4,
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, ItemKind::Boolean)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Boolean => "boolean",
            ItemKind::Int8 => "int8",
            ItemKind::UInt8 => "uint8",
            ItemKind::Int16 => "int16",
            ItemKind::UInt16 => "uint16",
            ItemKind::Int32 => "int32",
            ItemKind::UInt32 => "uint32",
            ItemKind::Real => "real",
        }
    }

    /// Inclusive integer range, `None` for non-integer kinds
    fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            ItemKind::Int8 => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            ItemKind::UInt8 => Some((0, i64::from(u8::MAX))),
            ItemKind::Int16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            ItemKind::UInt16 => Some((0, i64::from(u16::MAX))),
            ItemKind::Int32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            ItemKind::UInt32 => Some((0, i64::from(u32::MAX))),
            ItemKind::Boolean | ItemKind::Real => None,
        }
    }
}

impl FromStr for ItemKind {
    type Err = PlcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Ok(ItemKind::Boolean),
            "sint" | "int8" => Ok(ItemKind::Int8),
            "usint" | "uint8" | "byte" => Ok(ItemKind::UInt8),
            "int" | "int16" => Ok(ItemKind::Int16),
            "uint" | "uint16" => Ok(ItemKind::UInt16),
            "dint" | "int32" | "integer" => Ok(ItemKind::Int32),
            "udint" | "uint32" => Ok(ItemKind::UInt32),
            "real" | "float" => Ok(ItemKind::Real),
            other => Err(PlcError::config(format!(
                "unsupported item kind '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ItemKind {
    type Error = PlcError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ItemKind> for String {
    fn from(kind: ItemKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for ItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of one named field in a tag
#[derive(Debug, Clone, PartialEq)]
pub struct TagItem {
    name: String,
    kind: ItemKind,
    member: usize,
    byte_offset: usize,
    bit_offset: u8,
    bit_mask: i32,
    default: Option<TagValue>,
}

impl TagItem {
    pub fn new(
        name: impl Into<String>,
        kind: ItemKind,
        member: usize,
        byte_offset: usize,
        bit_offset: u8,
        default: Option<TagValue>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(PlcError::config("item name must not be empty"));
        }
        if kind.is_boolean() && bit_offset > 7 {
            return Err(PlcError::config(format!(
                "item '{}' bit offset {} is outside its byte",
                name, bit_offset
            )));
        }
        if byte_offset.checked_add(kind.width()).is_none() {
            return Err(PlcError::config(format!(
                "item '{}' byte offset {} is out of range",
                name, byte_offset
            )));
        }
        let bit_mask = if kind.is_boolean() {
            1i32 << bit_offset
        } else {
            -1
        };

        let mut item = Self {
            name,
            kind,
            member,
            byte_offset,
            bit_offset: if kind.is_boolean() { bit_offset } else { 0 },
            bit_mask,
            default: None,
        };
        if let Some(value) = default {
            let value = item
                .check_value(&value)
                .map_err(|e| PlcError::config(format!("default of item '{}': {}", item.name, e)))?;
            item.default = Some(value);
        }
        Ok(item)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Index of this item within its tag
    pub fn member(&self) -> usize {
        self.member
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    /// Single set bit for booleans, -1 otherwise
    pub fn bit_mask(&self) -> i32 {
        self.bit_mask
    }

    pub fn is_boolean(&self) -> bool {
        self.kind.is_boolean()
    }

    pub fn default_value(&self) -> Option<&TagValue> {
        self.default.as_ref()
    }

    /// Byte range the item touches; `new` rejects offsets where this overflows
    pub fn footprint(&self) -> Range<usize> {
        self.byte_offset..self.byte_offset + self.kind.width()
    }

    /// Validate a value against the item's kind, normalizing its representation
    pub fn check_value(&self, value: &TagValue) -> Result<TagValue> {
        match self.kind {
            ItemKind::Boolean => value.as_bool().map(TagValue::Bool).ok_or_else(|| {
                PlcError::invalid_argument(format!(
                    "item '{}' expects a boolean, got '{}'",
                    self.name, value
                ))
            }),
            ItemKind::Real => value.as_real().map(TagValue::Real).ok_or_else(|| {
                PlcError::invalid_argument(format!(
                    "item '{}' expects a real, got '{}'",
                    self.name, value
                ))
            }),
            _ => {
                let v = value.as_int().ok_or_else(|| {
                    PlcError::invalid_argument(format!(
                        "item '{}' expects an integer, got '{}'",
                        self.name, value
                    ))
                })?;
                if let Some((min, max)) = self.kind.int_range() {
                    if v < min || v > max {
                        return Err(PlcError::invalid_argument(format!(
                            "item '{}' value {} out of {} range",
                            self.name, v, self.kind
                        )));
                    }
                }
                Ok(TagValue::Int(v))
            },
        }
    }
}

impl std::fmt::Display for TagItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "item '{}' ({}) member {} ",
            self.name, self.kind, self.member
        )?;
        if self.is_boolean() {
            write!(
                f,
                "byte:bit = {}:{} (mask {:#06x})",
                self.byte_offset, self.bit_offset, self.bit_mask
            )
        } else {
            write!(f, "byte = {}", self.byte_offset)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!("BOOLEAN".parse::<ItemKind>().unwrap(), ItemKind::Boolean);
        assert_eq!("dint".parse::<ItemKind>().unwrap(), ItemKind::Int32);
        assert_eq!("integer".parse::<ItemKind>().unwrap(), ItemKind::Int32);
        assert_eq!("float".parse::<ItemKind>().unwrap(), ItemKind::Real);
        let err = "string".parse::<ItemKind>().unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
    }

    #[test]
    fn test_bit_mask_derivation() {
        for bit in 0..8u8 {
            let item = TagItem::new("flag", ItemKind::Boolean, 0, 2, bit, None).unwrap();
            assert_eq!(item.bit_mask(), 1 << bit);
            assert_eq!(item.bit_mask().count_ones(), 1);
        }
        let item = TagItem::new("count", ItemKind::Int16, 1, 4, 3, None).unwrap();
        assert_eq!(item.bit_mask(), -1);
        assert_eq!(item.bit_offset(), 0);
        assert_eq!(item.footprint(), 4..6);
    }

    #[test]
    fn test_bit_offset_out_of_byte() {
        assert!(TagItem::new("flag", ItemKind::Boolean, 0, 0, 8, None).is_err());
    }

    #[test]
    fn test_byte_offset_overflow() {
        let err = TagItem::new("w", ItemKind::Int16, 0, usize::MAX, 0, None).unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
        let item = TagItem::new("w", ItemKind::Int16, 0, usize::MAX - 2, 0, None).unwrap();
        assert_eq!(item.footprint().end, usize::MAX);
    }

    #[test]
    fn test_check_value_ranges() {
        let item = TagItem::new("b", ItemKind::UInt8, 0, 0, 0, None).unwrap();
        assert_eq!(item.check_value(&TagValue::Int(255)).unwrap(), TagValue::Int(255));
        assert!(item.check_value(&TagValue::Int(256)).is_err());
        assert!(item.check_value(&TagValue::Int(-1)).is_err());

        let flag = TagItem::new("f", ItemKind::Boolean, 0, 0, 1, None).unwrap();
        assert_eq!(flag.check_value(&TagValue::Int(1)).unwrap(), TagValue::Bool(true));
    }

    #[test]
    fn test_bad_default_is_config_error() {
        let err = TagItem::new(
            "cmd",
            ItemKind::Int8,
            0,
            0,
            0,
            Some(TagValue::Int(1000)),
        )
        .unwrap_err();
        assert!(matches!(err, PlcError::Config(_)));
    }
}
