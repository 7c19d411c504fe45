//! Capability item types and typed values.
//!
//! An item type fixes the byte width of every item in a container. Strings
//! occupy fixed-size slots: they are left-justified, zero-filled, and
//! truncated so that the terminating NUL always fits.

use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    Fix32,
    errors::{ProtocolError, Result},
};

/// Item type tag of a capability container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    /// Signed 8-bit
    Int8,
    /// Signed 16-bit
    Int16,
    /// Signed 32-bit
    Int32,
    /// Unsigned 8-bit
    UInt8,
    /// Unsigned 16-bit
    UInt16,
    /// Unsigned 32-bit
    UInt32,
    /// 16-bit boolean
    Bool,
    /// 16.16 fixed point
    Fix32,
    /// Four FIX32 edges
    Frame,
    /// 34-byte string slot
    Str32,
    /// 66-byte string slot
    Str64,
    /// 130-byte string slot
    Str128,
    /// 256-byte string slot
    Str255,
    /// 1026-byte string slot
    Str1024,
    /// 512 UTF-16 code units
    Uni512,
    /// Opaque memory handle
    Handle,
    /// Wildcard: let the container header decide
    Unknown,
    /// Tag outside the known set
    Unrecognized(u16),
}

impl ItemType {
    /// Wire value of the wildcard type.
    pub const UNKNOWN_RAW: u16 = 0xffff;

    /// Parse a raw item type tag.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0000 => Self::Int8,
            0x0001 => Self::Int16,
            0x0002 => Self::Int32,
            0x0003 => Self::UInt8,
            0x0004 => Self::UInt16,
            0x0005 => Self::UInt32,
            0x0006 => Self::Bool,
            0x0007 => Self::Fix32,
            0x0008 => Self::Frame,
            0x0009 => Self::Str32,
            0x000a => Self::Str64,
            0x000b => Self::Str128,
            0x000c => Self::Str255,
            0x000d => Self::Str1024,
            0x000e => Self::Uni512,
            0x000f => Self::Handle,
            Self::UNKNOWN_RAW => Self::Unknown,
            other => Self::Unrecognized(other),
        }
    }

    /// Raw wire tag.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Int8 => 0x0000,
            Self::Int16 => 0x0001,
            Self::Int32 => 0x0002,
            Self::UInt8 => 0x0003,
            Self::UInt16 => 0x0004,
            Self::UInt32 => 0x0005,
            Self::Bool => 0x0006,
            Self::Fix32 => 0x0007,
            Self::Frame => 0x0008,
            Self::Str32 => 0x0009,
            Self::Str64 => 0x000a,
            Self::Str128 => 0x000b,
            Self::Str255 => 0x000c,
            Self::Str1024 => 0x000d,
            Self::Uni512 => 0x000e,
            Self::Handle => 0x000f,
            Self::Unknown => Self::UNKNOWN_RAW,
            Self::Unrecognized(other) => other,
        }
    }

    /// Every concrete item type.
    pub const ALL: [Self; 16] = [
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::UInt8,
        Self::UInt16,
        Self::UInt32,
        Self::Bool,
        Self::Fix32,
        Self::Frame,
        Self::Str32,
        Self::Str64,
        Self::Str128,
        Self::Str255,
        Self::Str1024,
        Self::Uni512,
        Self::Handle,
    ];

    /// Width of one item in bytes. Zero means the type cannot be decoded.
    pub fn item_size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Bool => 2,
            Self::Int32 | Self::UInt32 | Self::Fix32 => 4,
            Self::Handle => 8,
            Self::Frame => 16,
            Self::Str32 => 34,
            Self::Str64 => 66,
            Self::Str128 => 130,
            Self::Str255 => 256,
            Self::Str1024 => 1026,
            Self::Uni512 => 1024,
            Self::Unknown | Self::Unrecognized(_) => 0,
        }
    }

    /// Effective item type of a decode.
    ///
    /// The wildcard defers to the type reported in the container header;
    /// any concrete request wins even when the header disagrees.
    pub fn resolve(requested: Self, reported: Self) -> Self {
        if requested == Self::Unknown { reported } else { requested }
    }

    /// Fixed-size string slot types.
    pub fn is_string(self) -> bool {
        matches!(
            self,
            Self::Str32 | Self::Str64 | Self::Str128 | Self::Str255 | Self::Str1024 | Self::Uni512
        )
    }

    /// Items at most four bytes wide fit a 32-bit slot (OneValue, Range).
    pub fn fits_slot(self) -> bool {
        let size = self.item_size();
        size > 0 && size <= 4
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::UInt8 => "UINT8",
            Self::UInt16 => "UINT16",
            Self::UInt32 => "UINT32",
            Self::Bool => "BOOL",
            Self::Fix32 => "FIX32",
            Self::Frame => "FRAME",
            Self::Str32 => "STR32",
            Self::Str64 => "STR64",
            Self::Str128 => "STR128",
            Self::Str255 => "STR255",
            Self::Str1024 => "STR1024",
            Self::Uni512 => "UNI512",
            Self::Handle => "HANDLE",
            Self::Unknown => "UNKNOWN",
            Self::Unrecognized(_) => "UNRECOGNIZED",
        }
    }

    /// Write one item of this type. Writes exactly [`Self::item_size`] bytes.
    pub fn write_item<B: BufMut>(self, value: &CapValue, out: &mut B) -> Result<()> {
        let mismatch =
            || ProtocolError::ValueMismatch { expected: self.name(), found: value.kind_name() };

        match self {
            Self::Int8 => out.put_i8(value.as_i64().ok_or_else(mismatch)? as i8),
            Self::Int16 => out.put_i16_le(value.as_i64().ok_or_else(mismatch)? as i16),
            Self::Int32 => out.put_i32_le(value.as_i64().ok_or_else(mismatch)? as i32),
            Self::UInt8 => out.put_u8(value.as_i64().ok_or_else(mismatch)? as u8),
            Self::UInt16 => out.put_u16_le(value.as_i64().ok_or_else(mismatch)? as u16),
            Self::UInt32 => out.put_u32_le(value.as_i64().ok_or_else(mismatch)? as u32),
            Self::Bool => out.put_u16_le(u16::from(value.as_bool().ok_or_else(mismatch)?)),
            Self::Fix32 => {
                out.put_slice(&Fix32::from_f64(value.as_f64().ok_or_else(mismatch)?).to_le_bytes());
            },
            Self::Frame => {
                let CapValue::Frame(frame) = value else { return Err(mismatch()) };
                for edge in [frame.left, frame.top, frame.right, frame.bottom] {
                    out.put_slice(&Fix32::from_f64(edge).to_le_bytes());
                }
            },
            Self::Handle => match value {
                CapValue::Handle(handle) => out.put_u64_le(*handle),
                CapValue::UInt32(raw) => out.put_u64_le(u64::from(*raw)),
                _ => return Err(mismatch()),
            },
            Self::Uni512 => {
                let CapValue::Str(text) = value else { return Err(mismatch()) };
                let units = utf16_truncated(text, self.item_size() / 2 - 1);
                for unit in &units {
                    out.put_u16_le(*unit);
                }
                out.put_bytes(0, self.item_size() - units.len() * 2);
            },
            Self::Str32 | Self::Str64 | Self::Str128 | Self::Str255 | Self::Str1024 => {
                let CapValue::Str(text) = value else { return Err(mismatch()) };
                let kept = truncate_at_char_boundary(text, self.item_size() - 1);
                out.put_slice(kept.as_bytes());
                out.put_bytes(0, self.item_size() - kept.len());
            },
            Self::Unknown | Self::Unrecognized(_) => {
                return Err(ProtocolError::UnknownItemType(self.to_u16()));
            },
        }
        Ok(())
    }

    /// Read one item of this type from the front of `bytes`.
    pub fn read_item(self, bytes: &[u8]) -> Result<CapValue> {
        let size = self.item_size();
        if size == 0 {
            return Err(ProtocolError::UnknownItemType(self.to_u16()));
        }
        if bytes.len() < size {
            return Err(ProtocolError::Truncated { needed: size, available: bytes.len() });
        }
        let mut buf = &bytes[..size];

        let value = match self {
            Self::Int8 => CapValue::Int8(buf.get_i8()),
            Self::Int16 => CapValue::Int16(buf.get_i16_le()),
            Self::Int32 => CapValue::Int32(buf.get_i32_le()),
            Self::UInt8 => CapValue::UInt8(buf.get_u8()),
            Self::UInt16 => CapValue::UInt16(buf.get_u16_le()),
            Self::UInt32 => CapValue::UInt32(buf.get_u32_le()),
            Self::Bool => CapValue::Bool(buf.get_u16_le() != 0),
            Self::Fix32 => CapValue::Fix32(Fix32::from_bits(buf.get_u32_le()).to_f64()),
            Self::Frame => {
                let mut edge = || Fix32::from_bits(buf.get_u32_le()).to_f64();
                CapValue::Frame(Frame { left: edge(), top: edge(), right: edge(), bottom: edge() })
            },
            Self::Handle => CapValue::Handle(buf.get_u64_le()),
            Self::Uni512 => {
                let units: Vec<u16> = buf
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .take_while(|unit| *unit != 0)
                    .collect();
                CapValue::Str(String::from_utf16_lossy(&units))
            },
            Self::Str32 | Self::Str64 | Self::Str128 | Self::Str255 | Self::Str1024 => {
                let end = buf.iter().position(|byte| *byte == 0).unwrap_or(buf.len());
                CapValue::Str(String::from_utf8_lossy(&buf[..end]).into_owned())
            },
            Self::Unknown | Self::Unrecognized(_) => {
                return Err(ProtocolError::UnknownItemType(self.to_u16()));
            },
        };
        Ok(value)
    }
}

impl Serialize for ItemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.to_u16())
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        u16::deserialize(deserializer).map(Self::from_u16)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn utf16_truncated(text: &str, max_units: usize) -> Vec<u16> {
    let mut units: Vec<u16> = text.encode_utf16().take(max_units).collect();
    // Never leave half of a surrogate pair behind
    if units.last().is_some_and(|unit| (0xd800..0xdc00).contains(unit)) {
        units.pop();
    }
    units
}

/// Rectangle in FIX32 units (usually inches).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Left edge
    pub left: f64,
    /// Top edge
    pub top: f64,
    /// Right edge
    pub right: f64,
    /// Bottom edge
    pub bottom: f64,
}

impl Frame {
    /// Build a frame from its four edges.
    pub fn new(left: f64, top: f64, right: f64, bottom: f64) -> Self {
        Self { left, top, right, bottom }
    }
}

/// One capability value in application form.
///
/// FIX32 items surface as `f64`; the raw fixed-point form never leaves the
/// codec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapValue {
    /// Signed 8-bit
    Int8(i8),
    /// Signed 16-bit
    Int16(i16),
    /// Signed 32-bit
    Int32(i32),
    /// Unsigned 8-bit
    UInt8(u8),
    /// Unsigned 16-bit
    UInt16(u16),
    /// Unsigned 32-bit
    UInt32(u32),
    /// Boolean
    Bool(bool),
    /// Fixed point surfaced as floating point
    Fix32(f64),
    /// Rectangle
    Frame(Frame),
    /// Any string slot type
    Str(String),
    /// Opaque handle
    Handle(u64),
}

impl CapValue {
    /// Integer view of numeric and boolean values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int8(v) => Some(i64::from(*v)),
            Self::Int16(v) => Some(i64::from(*v)),
            Self::Int32(v) => Some(i64::from(*v)),
            Self::UInt8(v) => Some(i64::from(*v)),
            Self::UInt16(v) => Some(i64::from(*v)),
            Self::UInt32(v) => Some(i64::from(*v)),
            Self::Bool(v) => Some(i64::from(*v)),
            Self::Fix32(v) => Some(v.round() as i64),
            Self::Frame(_) | Self::Str(_) | Self::Handle(_) => None,
        }
    }

    /// Floating-point view of numeric values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Fix32(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Boolean view: booleans, and integers compared against zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            Self::Fix32(_) => None,
            other => other.as_i64().map(|v| v != 0),
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Name of the value's variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Int8(_) => "Int8",
            Self::Int16(_) => "Int16",
            Self::Int32(_) => "Int32",
            Self::UInt8(_) => "UInt8",
            Self::UInt16(_) => "UInt16",
            Self::UInt32(_) => "UInt32",
            Self::Bool(_) => "Bool",
            Self::Fix32(_) => "Fix32",
            Self::Frame(_) => "Frame",
            Self::Str(_) => "Str",
            Self::Handle(_) => "Handle",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_concrete_request() {
        assert_eq!(ItemType::resolve(ItemType::Unknown, ItemType::UInt16), ItemType::UInt16);
        assert_eq!(ItemType::resolve(ItemType::Int32, ItemType::UInt16), ItemType::Int32);
    }

    #[test]
    fn raw_tags_round_trip() {
        for item in ItemType::ALL {
            assert_eq!(ItemType::from_u16(item.to_u16()), item);
            assert!(item.item_size() > 0);
        }
        assert_eq!(ItemType::from_u16(0x0042), ItemType::Unrecognized(0x0042));
        assert_eq!(ItemType::Unrecognized(0x0042).item_size(), 0);
    }

    #[test]
    fn string_is_truncated_to_keep_terminator() {
        let long = "x".repeat(40);
        let mut buf = Vec::new();
        ItemType::Str32.write_item(&CapValue::Str(long), &mut buf).unwrap();

        assert_eq!(buf.len(), 34);
        assert_eq!(buf[33], 0);
        assert_eq!(ItemType::Str32.read_item(&buf).unwrap(), CapValue::Str("x".repeat(33)));
    }

    #[test]
    fn string_truncation_respects_char_boundaries() {
        // 'é' is two bytes; 16 of them is 32 bytes, the 17th would straddle 33
        let text = "é".repeat(17);
        let mut buf = Vec::new();
        ItemType::Str32.write_item(&CapValue::Str(text), &mut buf).unwrap();

        assert_eq!(ItemType::Str32.read_item(&buf).unwrap(), CapValue::Str("é".repeat(16)));
    }

    #[test]
    fn unicode_slot_round_trips() {
        let mut buf = Vec::new();
        ItemType::Uni512.write_item(&CapValue::Str("Scan ✓".into()), &mut buf).unwrap();

        assert_eq!(buf.len(), 1024);
        assert_eq!(ItemType::Uni512.read_item(&buf).unwrap(), CapValue::Str("Scan ✓".into()));
    }

    #[test]
    fn frame_is_four_fixed_point_edges() {
        let frame = Frame::new(0.0, 0.0, 8.5, 11.0);
        let mut buf = Vec::new();
        ItemType::Frame.write_item(&CapValue::Frame(frame), &mut buf).unwrap();

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[8..12], &[8, 0, 0, 0x80]);
        assert_eq!(ItemType::Frame.read_item(&buf).unwrap(), CapValue::Frame(frame));
    }

    #[test]
    fn integers_coerce_between_widths() {
        let mut buf = Vec::new();
        ItemType::UInt16.write_item(&CapValue::Int32(600), &mut buf).unwrap();
        assert_eq!(ItemType::UInt16.read_item(&buf).unwrap(), CapValue::UInt16(600));
    }

    #[test]
    fn string_into_numeric_is_rejected() {
        let mut buf = Vec::new();
        let err = ItemType::Int32.write_item(&CapValue::Str("1".into()), &mut buf).unwrap_err();
        assert_eq!(err, ProtocolError::ValueMismatch { expected: "INT32", found: "Str" });
    }

    #[test]
    fn reading_short_buffer_fails() {
        let err = ItemType::Int32.read_item(&[1, 2]).unwrap_err();
        assert_eq!(err, ProtocolError::Truncated { needed: 4, available: 2 });
    }
}
