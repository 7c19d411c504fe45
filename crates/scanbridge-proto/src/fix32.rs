//! 16.16 fixed-point numbers.
//!
//! On the wire a FIX32 is a signed 16-bit whole part followed by an
//! unsigned 16-bit fraction in 1/65536ths. Conversion from floating point
//! rounds half away from zero. Values outside the representable range
//! saturate.

use serde::{Deserialize, Serialize};

/// A 16.16 fixed-point value as stored on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Fix32 {
    /// Signed integral part
    pub whole: i16,
    /// Fraction in 1/65536ths
    pub frac: u16,
}

impl Fix32 {
    /// Size on the wire.
    pub const SIZE: usize = 4;

    /// Smallest step representable.
    pub const EPSILON: f64 = 1.0 / 65536.0;

    /// Convert from floating point, rounding half away from zero.
    pub fn from_f64(value: f64) -> Self {
        // `as` saturates, so NaN maps to zero and overflow clamps
        let scaled = (value * 65536.0).round() as i32;
        Self { whole: (scaled >> 16) as i16, frac: (scaled & 0xffff) as u16 }
    }

    /// Convert to floating point.
    pub fn to_f64(self) -> f64 {
        f64::from(self.whole) + f64::from(self.frac) / 65536.0
    }

    /// Pack into the 32-bit slot layout (whole in the low half).
    pub fn to_bits(self) -> u32 {
        u32::from(self.whole as u16) | (u32::from(self.frac) << 16)
    }

    /// Unpack from the 32-bit slot layout.
    pub fn from_bits(bits: u32) -> Self {
        Self { whole: (bits & 0xffff) as u16 as i16, frac: (bits >> 16) as u16 }
    }

    /// Little-endian wire bytes.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.to_bits().to_le_bytes()
    }

    /// Parse little-endian wire bytes.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_bits(u32::from_le_bytes(bytes))
    }
}

impl From<f64> for Fix32 {
    fn from(value: f64) -> Self {
        Self::from_f64(value)
    }
}

impl From<Fix32> for f64 {
    fn from(value: Fix32) -> Self {
        value.to_f64()
    }
}
