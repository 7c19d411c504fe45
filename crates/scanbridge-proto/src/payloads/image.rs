//! Image-group payload records.

use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{Frame, MemHandle};

/// Metadata of the image about to be transferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Horizontal resolution in pixels per unit
    pub x_resolution: f64,
    /// Vertical resolution in pixels per unit
    pub y_resolution: f64,
    /// Width in pixels, `-1` when unknown
    pub image_width: i32,
    /// Height in pixels, `-1` when unknown (feeder without length detection)
    pub image_length: i32,
    /// Samples per pixel
    pub samples_per_pixel: i16,
    /// Bits per sample, per channel
    pub bits_per_sample: [i16; 8],
    /// Bits per pixel
    pub bits_per_pixel: i16,
    /// Planar rather than chunky
    pub planar: bool,
    /// Pixel type code
    pub pixel_type: i16,
    /// Compression code
    pub compression: u16,
}

impl Default for ImageInfo {
    fn default() -> Self {
        Self {
            x_resolution: 0.0,
            y_resolution: 0.0,
            image_width: -1,
            image_length: -1,
            samples_per_pixel: 1,
            bits_per_sample: [0; 8],
            bits_per_pixel: 0,
            planar: false,
            pixel_type: 0,
            compression: 0,
        }
    }
}

impl ImageInfo {
    /// Bytes per row, padded to a 32-bit boundary.
    pub fn bytes_per_row(&self) -> Option<u32> {
        let width = u64::try_from(self.image_width).ok()?;
        let bits = u64::try_from(self.bits_per_pixel).ok()?;
        let row = (width * bits).div_ceil(32) * 4;
        u32::try_from(row).ok()
    }

    /// Estimated uncompressed size, when the dimensions are known.
    pub fn estimated_size(&self) -> Option<u32> {
        let rows = u32::try_from(self.image_length).ok()?;
        self.bytes_per_row()?.checked_mul(rows)
    }
}

/// Placement of the acquired area on the scanner bed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageLayout {
    /// Area to acquire
    pub frame: Frame,
    /// Document number
    pub document_number: u32,
    /// Page number within the document
    pub page_number: u32,
    /// Frame number within the page
    pub frame_number: u32,
}

/// Buffer sizes the source accepts for buffered transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SetupMemXfer {
    /// Smallest acceptable buffer
    pub min_buf_size: u32,
    /// Largest acceptable buffer
    pub max_buf_size: u32,
    /// Preferred buffer size
    pub preferred: u32,
}

bitflags! {
    /// Ownership and addressing of a transfer buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct MemoryFlags: u32 {
        /// Application allocated the buffer
        const APP_OWNS = 0x0001;
        /// Broker allocated the buffer
        const DSM_OWNS = 0x0002;
        /// Source allocated the buffer
        const DS_OWNS = 0x0004;
        /// Buffer is addressed by pointer
        const POINTER = 0x0008;
        /// Buffer is addressed by handle
        const HANDLE = 0x0010;
    }
}

/// One strip of a buffered transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageMemXfer {
    /// Compression of this strip
    pub compression: u16,
    /// Bytes per row
    pub bytes_per_row: u32,
    /// Columns in the strip
    pub columns: u32,
    /// Rows in the strip
    pub rows: u32,
    /// Horizontal offset of the strip
    pub x_offset: u32,
    /// Vertical offset of the strip
    pub y_offset: u32,
    /// Bytes the source wrote into the buffer
    pub bytes_written: u32,
    /// Buffer ownership flags
    pub memory_flags: MemoryFlags,
    /// Buffer length in bytes
    pub memory_length: u32,
    /// Buffer handle supplied by the application
    pub memory_handle: Option<MemHandle>,
}

/// File format of a file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileFormat {
    /// TIFF
    Tiff,
    /// BMP
    Bmp,
    /// JFIF / JPEG
    Jfif,
    /// Multi-page TIFF
    TiffMulti,
    /// PNG
    Png,
    /// PDF
    Pdf,
    /// PDF/A
    PdfA,
    /// WAV (audio)
    Wav,
    /// AIFF (audio)
    Aiff,
    /// Any other raw code
    Other(u16),
}

impl FileFormat {
    /// Raw wire code. Audio codes share the numbering with image codes.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Tiff | Self::Wav => 0,
            Self::Bmp => 2,
            Self::Jfif => 4,
            Self::TiffMulti => 6,
            Self::Png => 7,
            Self::Pdf => 10,
            Self::PdfA => 15,
            Self::Aiff => 1,
            Self::Other(code) => code,
        }
    }

    /// Parse a raw image file format code.
    pub fn from_image_code(code: u16) -> Self {
        match code {
            0 => Self::Tiff,
            2 => Self::Bmp,
            4 => Self::Jfif,
            6 => Self::TiffMulti,
            7 => Self::Png,
            10 => Self::Pdf,
            15 => Self::PdfA,
            other => Self::Other(other),
        }
    }

    /// Conventional file extension.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Tiff | Self::TiffMulti => "tif",
            Self::Bmp => "bmp",
            Self::Jfif => "jpg",
            Self::Png => "png",
            Self::Pdf | Self::PdfA => "pdf",
            Self::Wav => "wav",
            Self::Aiff => "aif",
            Self::Other(_) => "bin",
        }
    }
}

/// Destination of a file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupFileXfer {
    /// Path the source writes to
    pub path: PathBuf,
    /// File format
    pub format: FileFormat,
    /// Volume reference (legacy platforms)
    pub vref: i16,
}

impl Default for SetupFileXfer {
    fn default() -> Self {
        Self { path: PathBuf::new(), format: FileFormat::Bmp, vref: -1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_size_pads_rows_to_dwords() {
        let info = ImageInfo {
            image_width: 10,
            image_length: 3,
            bits_per_pixel: 1,
            ..ImageInfo::default()
        };
        assert_eq!(info.bytes_per_row(), Some(4));
        assert_eq!(info.estimated_size(), Some(12));
    }

    #[test]
    fn unknown_length_has_no_estimate() {
        let info = ImageInfo { image_width: 100, bits_per_pixel: 24, ..ImageInfo::default() };
        assert_eq!(info.bytes_per_row(), Some(300));
        assert_eq!(info.estimated_size(), None);
    }
}
