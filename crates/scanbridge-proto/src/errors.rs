//! Error types for wire encoding and decoding.

use thiserror::Error;

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer ended before the record did.
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required to finish decoding
        needed: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Item type has no known width.
    #[error("unknown item type 0x{0:04x}")]
    UnknownItemType(u16),

    /// Container shape tag is not one of the four shapes.
    #[error("unknown container shape 0x{0:04x}")]
    UnknownShape(u16),

    /// Item type cannot be carried by this container shape.
    #[error("item type {item_type} is not valid in a {shape} container")]
    UnsupportedItemType {
        /// Offending item type name
        item_type: &'static str,
        /// Container shape name
        shape: &'static str,
    },

    /// Value does not fit the declared item type.
    #[error("value {found} cannot be stored as {expected}")]
    ValueMismatch {
        /// Declared item type
        expected: &'static str,
        /// Kind of value supplied
        found: &'static str,
    },

    /// Container carries no items where at least one is required.
    #[error("{0} container requires at least one value")]
    Empty(&'static str),

    /// Index stored in an enumeration points past its item list.
    #[error("enumeration index {index} out of bounds for {count} items")]
    IndexOutOfBounds {
        /// Stored index
        index: u32,
        /// Number of items
        count: u32,
    },
}
