//! Capability container layouts.
//!
//! Four shapes carry capability values. The shape tag itself travels in the
//! capability record next to the container handle; the container buffer
//! starts with a shape-specific header:
//!
//! ```text
//! OneValue     item_type:u16 | item (32-bit slot, wider items inline)
//! Array        item_type:u16 | count:u32 | items...
//! Enumeration  item_type:u16 | count:u32 | current:u32 | default:u32 | items...
//! Range        item_type:u16 | min:u32 | max:u32 | step:u32 | default:u32 | current:u32
//! ```
//!
//! All integers are little-endian. OneValue and Range items live in 32-bit
//! slots, so only items at most four bytes wide may appear in a Range.
//! A buffer is sized as the header plus the item width times
//! `max(count, 1)`; a Range counts as five slots.

use std::fmt;

use serde::{Deserialize, Serialize};
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

use crate::{
    CapValue, ItemType,
    errors::{ProtocolError, Result},
};

/// "Don't care" marker for 32-bit fields.
pub const DONTCARE32: u32 = 0xffff_ffff;

/// "Don't care" marker for 16-bit fields.
pub const DONTCARE16: u16 = 0xffff;

/// Container shape tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerShape {
    /// A list of values with no current/default
    Array,
    /// A list of values with current and default indices
    Enumeration,
    /// A single value
    OneValue,
    /// Min/max/step/default/current
    Range,
}

impl ContainerShape {
    /// Parse a raw shape tag.
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            3 => Ok(Self::Array),
            4 => Ok(Self::Enumeration),
            5 => Ok(Self::OneValue),
            6 => Ok(Self::Range),
            other => Err(ProtocolError::UnknownShape(other)),
        }
    }

    /// Raw shape tag.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Array => 3,
            Self::Enumeration => 4,
            Self::OneValue => 5,
            Self::Range => 6,
        }
    }

    /// Fixed header bytes in front of the item list.
    pub fn header_size(self) -> usize {
        match self {
            Self::OneValue | Self::Range => 2,
            Self::Array => size_of::<ArrayHeader>(),
            Self::Enumeration => size_of::<EnumerationHeader>(),
        }
    }

    /// Width one item occupies in this shape.
    pub fn item_width(self, item_type: ItemType) -> usize {
        match self {
            Self::OneValue | Self::Range => item_type.item_size().max(4),
            Self::Array | Self::Enumeration => item_type.item_size(),
        }
    }

    /// Buffer size for `count` items of `item_type`.
    pub fn buffer_size(self, item_type: ItemType, count: usize) -> usize {
        let slots = match self {
            Self::Range => RangeRecord::SLOTS,
            _ => count.max(1),
        };
        self.header_size() + self.item_width(item_type) * slots
    }

    /// Short display name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Array => "Array",
            Self::Enumeration => "Enumeration",
            Self::OneValue => "OneValue",
            Self::Range => "Range",
        }
    }
}

impl fmt::Display for ContainerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct ArrayHeader {
    item_type: U16,
    num_items: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct EnumerationHeader {
    item_type: U16,
    num_items: U32,
    current_index: U32,
    default_index: U32,
}

/// Raw Range record, exactly as it sits in the buffer.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct RangeRecord {
    item_type: U16,
    min: U32,
    max: U32,
    step: U32,
    default: U32,
    current: U32,
}

impl RangeRecord {
    /// Size of the record on the wire.
    pub const SIZE: usize = size_of::<Self>();

    /// Logical value slots: min, max, step, default, current.
    pub const SLOTS: usize = 5;

    /// Reported item type tag.
    pub fn item_type(&self) -> u16 {
        self.item_type.get()
    }

    /// Raw 32-bit slots in min, max, step, default, current order.
    pub fn slots(&self) -> [u32; 5] {
        [self.min.get(), self.max.get(), self.step.get(), self.default.get(), self.current.get()]
    }

    /// Whether the default field carries the "don't care" marker.
    pub fn default_is_dontcare(&self) -> bool {
        self.default.get() == DONTCARE32
    }

    /// Record bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

impl fmt::Debug for RangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [min, max, step, default, current] = self.slots();
        f.debug_struct("RangeRecord")
            .field("item_type", &self.item_type())
            .field("min", &min)
            .field("max", &max)
            .field("step", &step)
            .field("default", &default)
            .field("current", &current)
            .finish()
    }
}

/// Capability values in application form, tagged by shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Container {
    /// A single value
    OneValue {
        /// Item type
        item_type: ItemType,
        /// The value
        value: CapValue,
    },
    /// A list of values
    Array {
        /// Item type
        item_type: ItemType,
        /// The values
        values: Vec<CapValue>,
    },
    /// A list of allowed values with current and default indices
    Enumeration {
        /// Item type
        item_type: ItemType,
        /// Allowed values
        values: Vec<CapValue>,
        /// Index of the current value
        current_index: u32,
        /// Index of the default value
        default_index: u32,
    },
    /// A stepped numeric range
    Range {
        /// Item type
        item_type: ItemType,
        /// Smallest value
        min: CapValue,
        /// Largest value
        max: CapValue,
        /// Step between values
        step: CapValue,
        /// Current value
        current: CapValue,
        /// Default value, `None` when the source reported "don't care".
        /// Always written as "don't care" on encode.
        default: Option<CapValue>,
    },
}

impl Container {
    /// A single value.
    pub fn one(item_type: ItemType, value: CapValue) -> Self {
        Self::OneValue { item_type, value }
    }

    /// Shape of this container.
    pub fn shape(&self) -> ContainerShape {
        match self {
            Self::OneValue { .. } => ContainerShape::OneValue,
            Self::Array { .. } => ContainerShape::Array,
            Self::Enumeration { .. } => ContainerShape::Enumeration,
            Self::Range { .. } => ContainerShape::Range,
        }
    }

    /// Item type of this container.
    pub fn item_type(&self) -> ItemType {
        match self {
            Self::OneValue { item_type, .. }
            | Self::Array { item_type, .. }
            | Self::Enumeration { item_type, .. }
            | Self::Range { item_type, .. } => *item_type,
        }
    }

    /// Number of items written to the buffer.
    pub fn count(&self) -> usize {
        match self {
            Self::OneValue { .. } => 1,
            Self::Array { values, .. } | Self::Enumeration { values, .. } => values.len(),
            Self::Range { .. } => RangeRecord::SLOTS,
        }
    }

    /// Values carried, in wire order. Range yields min, max, step, current.
    pub fn values(&self) -> Vec<&CapValue> {
        match self {
            Self::OneValue { value, .. } => vec![value],
            Self::Array { values, .. } | Self::Enumeration { values, .. } => values.iter().collect(),
            Self::Range { min, max, step, current, .. } => vec![min, max, step, current],
        }
    }

    /// The value the source considers current, where the shape has one.
    pub fn current(&self) -> Option<&CapValue> {
        match self {
            Self::OneValue { value, .. } => Some(value),
            Self::Enumeration { values, current_index, .. } => values.get(*current_index as usize),
            Self::Range { current, .. } => Some(current),
            Self::Array { values, .. } => values.first(),
        }
    }

    /// Buffer size this container encodes to.
    pub fn buffer_size(&self) -> usize {
        self.shape().buffer_size(self.item_type(), self.count())
    }

    /// Encode into a freshly sized buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.buffer_size()];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Encode into `out`, which must be at least [`Self::buffer_size`] long.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<()> {
        let item_type = self.item_type();
        if item_type.item_size() == 0 {
            return Err(ProtocolError::UnknownItemType(item_type.to_u16()));
        }
        let needed = self.buffer_size();
        if out.len() < needed {
            return Err(ProtocolError::Truncated { needed, available: out.len() });
        }
        let out = &mut out[..needed];
        out.fill(0);

        let raw_type = U16::new(item_type.to_u16());
        match self {
            Self::OneValue { value, .. } => {
                out[..2].copy_from_slice(raw_type.as_bytes());
                write_items(item_type, std::iter::once(value), &mut out[2..])?;
            },
            Self::Array { values, .. } => {
                let header = ArrayHeader { item_type: raw_type, num_items: U32::new(count32(values)) };
                let (head, items) = out.split_at_mut(size_of::<ArrayHeader>());
                head.copy_from_slice(header.as_bytes());
                write_items(item_type, values.iter(), items)?;
            },
            Self::Enumeration { values, current_index, default_index, .. } => {
                if values.is_empty() {
                    return Err(ProtocolError::Empty("Enumeration"));
                }
                let count = count32(values);
                for index in [*current_index, *default_index] {
                    if index >= count {
                        return Err(ProtocolError::IndexOutOfBounds { index, count });
                    }
                }
                let header = EnumerationHeader {
                    item_type: raw_type,
                    num_items: U32::new(count),
                    current_index: U32::new(*current_index),
                    default_index: U32::new(*default_index),
                };
                let (head, items) = out.split_at_mut(size_of::<EnumerationHeader>());
                head.copy_from_slice(header.as_bytes());
                write_items(item_type, values.iter(), items)?;
            },
            Self::Range { min, max, step, current, .. } => {
                if !item_type.fits_slot() {
                    return Err(ProtocolError::UnsupportedItemType {
                        item_type: item_type.name(),
                        shape: "Range",
                    });
                }
                let record = RangeRecord {
                    item_type: raw_type,
                    min: U32::new(slot_bits(item_type, min)?),
                    max: U32::new(slot_bits(item_type, max)?),
                    step: U32::new(slot_bits(item_type, step)?),
                    // The caller's default is never sent
                    default: U32::new(DONTCARE32),
                    current: U32::new(slot_bits(item_type, current)?),
                };
                out[..RangeRecord::SIZE].copy_from_slice(record.as_bytes());
            },
        }
        Ok(())
    }

    /// Decode a container buffer without any broker involvement.
    ///
    /// `requested` follows [`ItemType::resolve`]: the wildcard accepts the
    /// reported type, anything else overrides it.
    pub fn decode(shape: ContainerShape, bytes: &[u8], requested: ItemType) -> Result<Self> {
        let view = ContainerView::parse(shape, bytes)?;
        let item_type = view.effective_type(requested)?;
        let item = |index: usize| -> Result<CapValue> {
            item_type.read_item(view.item_bytes(item_type, index)?)
        };

        let container = match shape {
            ContainerShape::OneValue => Self::OneValue { item_type, value: item(0)? },
            ContainerShape::Array => Self::Array {
                item_type,
                values: (0..view.count()).map(item).collect::<Result<Vec<_>>>()?,
            },
            ContainerShape::Enumeration => Self::Enumeration {
                item_type,
                values: (0..view.count()).map(item).collect::<Result<Vec<_>>>()?,
                current_index: view.current_index(),
                default_index: view.default_index(),
            },
            ContainerShape::Range => Self::Range {
                item_type,
                min: item(0)?,
                max: item(1)?,
                step: item(2)?,
                default: if view.default_is_dontcare() { None } else { Some(item(3)?) },
                current: item(4)?,
            },
        };
        Ok(container)
    }
}

fn count32(values: &[CapValue]) -> u32 {
    u32::try_from(values.len()).unwrap_or(u32::MAX)
}

fn write_items<'a>(
    item_type: ItemType,
    values: impl Iterator<Item = &'a CapValue>,
    out: &mut [u8],
) -> Result<()> {
    let size = item_type.item_size();
    let available = out.len();
    for (index, value) in values.enumerate() {
        let start = index * size;
        let mut slot = out
            .get_mut(start..start + size)
            .ok_or(ProtocolError::Truncated { needed: start + size, available })?;
        item_type.write_item(value, &mut slot)?;
    }
    Ok(())
}

fn slot_bits(item_type: ItemType, value: &CapValue) -> Result<u32> {
    let mut slot = [0u8; 4];
    item_type.write_item(value, &mut &mut slot[..])?;
    Ok(u32::from_le_bytes(slot))
}

/// Parsed container header with borrowed item bytes.
///
/// This is the probe-level view: shape and reported item type are known
/// without materializing any values.
#[derive(Debug, Clone, Copy)]
pub struct ContainerView<'a> {
    shape: ContainerShape,
    reported: ItemType,
    count: usize,
    current_index: u32,
    default_index: u32,
    range: Option<RangeRecord>,
    items: &'a [u8],
}

impl<'a> ContainerView<'a> {
    /// Parse the header of a container buffer.
    pub fn parse(shape: ContainerShape, bytes: &'a [u8]) -> Result<Self> {
        let truncated = |needed: usize| ProtocolError::Truncated { needed, available: bytes.len() };

        let view = match shape {
            ContainerShape::OneValue => {
                let (raw, items) =
                    U16::read_from_prefix(bytes).map_err(|_| truncated(shape.header_size()))?;
                Self {
                    shape,
                    reported: ItemType::from_u16(raw.get()),
                    count: 1,
                    current_index: 0,
                    default_index: 0,
                    range: None,
                    items,
                }
            },
            ContainerShape::Array => {
                let (header, items) = ArrayHeader::read_from_prefix(bytes)
                    .map_err(|_| truncated(shape.header_size()))?;
                Self {
                    shape,
                    reported: ItemType::from_u16(header.item_type.get()),
                    count: header.num_items.get() as usize,
                    current_index: 0,
                    default_index: 0,
                    range: None,
                    items,
                }
            },
            ContainerShape::Enumeration => {
                let (header, items) = EnumerationHeader::read_from_prefix(bytes)
                    .map_err(|_| truncated(shape.header_size()))?;
                Self {
                    shape,
                    reported: ItemType::from_u16(header.item_type.get()),
                    count: header.num_items.get() as usize,
                    current_index: header.current_index.get(),
                    default_index: header.default_index.get(),
                    range: None,
                    items,
                }
            },
            ContainerShape::Range => {
                let (record, _) =
                    RangeRecord::read_from_prefix(bytes).map_err(|_| truncated(RangeRecord::SIZE))?;
                Self {
                    shape,
                    reported: ItemType::from_u16(record.item_type()),
                    count: RangeRecord::SLOTS,
                    current_index: 0,
                    default_index: 0,
                    range: Some(record),
                    items: &bytes[2..RangeRecord::SIZE],
                }
            },
        };
        Ok(view)
    }

    /// Container shape.
    pub fn shape(&self) -> ContainerShape {
        self.shape
    }

    /// Item type written in the header.
    pub fn reported_type(&self) -> ItemType {
        self.reported
    }

    /// Number of items (five logical slots for a Range).
    pub fn count(&self) -> usize {
        self.count
    }

    /// Enumeration current index.
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    /// Enumeration default index.
    pub fn default_index(&self) -> u32 {
        self.default_index
    }

    /// Raw Range record, for Range containers.
    pub fn range_record(&self) -> Option<RangeRecord> {
        self.range
    }

    /// Whether a Range reported "don't care" as its default.
    pub fn default_is_dontcare(&self) -> bool {
        self.range.is_some_and(|record| record.default_is_dontcare())
    }

    /// Resolve the item type to decode with. Fails when it has no width.
    pub fn effective_type(&self, requested: ItemType) -> Result<ItemType> {
        let item_type = ItemType::resolve(requested, self.reported);
        if item_type.item_size() == 0 {
            return Err(ProtocolError::UnknownItemType(item_type.to_u16()));
        }
        if self.shape == ContainerShape::Range && !item_type.fits_slot() {
            return Err(ProtocolError::UnsupportedItemType {
                item_type: item_type.name(),
                shape: "Range",
            });
        }
        Ok(item_type)
    }

    /// Bytes of the item at `index` when decoded as `item_type`.
    pub fn item_bytes(&self, item_type: ItemType, index: usize) -> Result<&'a [u8]> {
        let size = item_type.item_size();
        let stride = self.shape.item_width(item_type).max(size);
        let start = stride
            .checked_mul(index)
            .ok_or(ProtocolError::Truncated { needed: usize::MAX, available: self.items.len() })?;
        let end = start + size;
        self.items
            .get(start..end)
            .ok_or(ProtocolError::Truncated { needed: end, available: self.items.len() })
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;
    use crate::Frame;

    #[test]
    fn one_value_uint16_wire_bytes() {
        let container = Container::one(ItemType::UInt16, CapValue::UInt16(0x0102));
        assert_eq!(container.encode().unwrap(), hex!("0400 0201 0000"));
    }

    #[test]
    fn array_wire_bytes() {
        let container = Container::Array {
            item_type: ItemType::UInt16,
            values: vec![CapValue::UInt16(1), CapValue::UInt16(0x1005)],
        };
        assert_eq!(container.encode().unwrap(), hex!("0400 02000000 0100 0510"));
    }

    #[test]
    fn range_always_sends_dontcare_default() {
        let container = Container::Range {
            item_type: ItemType::Fix32,
            min: CapValue::Fix32(75.0),
            max: CapValue::Fix32(1200.0),
            step: CapValue::Fix32(1.0),
            current: CapValue::Fix32(300.0),
            default: Some(CapValue::Fix32(150.0)),
        };
        let bytes = container.encode().unwrap();
        assert_eq!(bytes.len(), RangeRecord::SIZE);

        let view = ContainerView::parse(ContainerShape::Range, &bytes).unwrap();
        assert!(view.default_is_dontcare());
        assert_eq!(&bytes[14..18], &hex!("ffffffff"));

        let Container::Range { default, current, .. } =
            Container::decode(ContainerShape::Range, &bytes, ItemType::Unknown).unwrap()
        else {
            unreachable!("shape is Range");
        };
        assert_eq!(default, None);
        assert_eq!(current, CapValue::Fix32(300.0));
    }

    #[test]
    fn enumeration_round_trips_with_indices() {
        let container = Container::Enumeration {
            item_type: ItemType::Str32,
            values: vec![CapValue::Str("Letter".into()), CapValue::Str("A4".into())],
            current_index: 1,
            default_index: 0,
        };
        let bytes = container.encode().unwrap();
        assert_eq!(bytes.len(), 14 + 2 * 34);
        assert_eq!(Container::decode(ContainerShape::Enumeration, &bytes, ItemType::Unknown).unwrap(), container);
        assert_eq!(container.current(), Some(&CapValue::Str("A4".into())));
    }

    #[test]
    fn enumeration_rejects_out_of_bounds_index() {
        let container = Container::Enumeration {
            item_type: ItemType::UInt16,
            values: vec![CapValue::UInt16(1)],
            current_index: 3,
            default_index: 0,
        };
        assert_eq!(
            container.encode().unwrap_err(),
            ProtocolError::IndexOutOfBounds { index: 3, count: 1 }
        );
    }

    #[test]
    fn range_rejects_wide_items() {
        let frame = CapValue::Frame(Frame::default());
        let container = Container::Range {
            item_type: ItemType::Frame,
            min: frame.clone(),
            max: frame.clone(),
            step: frame.clone(),
            current: frame,
            default: None,
        };
        assert!(matches!(container.encode(), Err(ProtocolError::UnsupportedItemType { .. })));
    }

    #[test]
    fn requested_type_overrides_reported_type() {
        // Header says UINT16, caller insists on INT16
        let bytes = Container::one(ItemType::UInt16, CapValue::UInt16(0xffff)).encode().unwrap();
        let decoded = Container::decode(ContainerShape::OneValue, &bytes, ItemType::Int16).unwrap();
        assert_eq!(decoded, Container::one(ItemType::Int16, CapValue::Int16(-1)));
    }

    #[test]
    fn unknown_reported_type_fails_under_wildcard() {
        let bytes = hex!("4200 01000000");
        assert_eq!(
            Container::decode(ContainerShape::OneValue, &bytes, ItemType::Unknown).unwrap_err(),
            ProtocolError::UnknownItemType(0x0042)
        );
    }

    #[test]
    fn array_count_past_buffer_is_truncated() {
        // Claims 1000 UINT32 items but carries one
        let bytes = hex!("0500 e8030000 01000000");
        assert!(matches!(
            Container::decode(ContainerShape::Array, &bytes, ItemType::Unknown),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn encode_into_short_buffer_is_truncated() {
        let container = Container::Array {
            item_type: ItemType::UInt32,
            values: vec![CapValue::UInt32(1), CapValue::UInt32(2)],
        };
        let mut out = [0u8; 8];
        assert_eq!(
            container.encode_into(&mut out),
            Err(ProtocolError::Truncated { needed: 14, available: 8 })
        );

        let mut out = [0xffu8; 16];
        container.encode_into(&mut out).unwrap();
        assert_eq!(out[..14], hex!("0500 02000000 01000000 02000000"));
        assert_eq!(out[14..], [0xff, 0xff]);
    }

    #[test]
    fn empty_array_still_reserves_one_slot() {
        let container = Container::Array { item_type: ItemType::Int32, values: Vec::new() };
        assert_eq!(container.buffer_size(), 6 + 4);
        let bytes = container.encode().unwrap();
        assert_eq!(Container::decode(ContainerShape::Array, &bytes, ItemType::Unknown).unwrap(), container);
    }

    #[test]
    fn shape_tags_round_trip() {
        for shape in [
            ContainerShape::Array,
            ContainerShape::Enumeration,
            ContainerShape::OneValue,
            ContainerShape::Range,
        ] {
            assert_eq!(ContainerShape::from_u16(shape.to_u16()).unwrap(), shape);
        }
        assert_eq!(ContainerShape::from_u16(9).unwrap_err(), ProtocolError::UnknownShape(9));
    }
}
