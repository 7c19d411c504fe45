//! Capability identifiers and query-support flags.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::ItemType;

/// Numeric capability identifier.
///
/// Vendors define custom capabilities above `0x8000`, so this is an open
/// newtype with constants for the capabilities the client itself relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(pub u16);

impl CapabilityId {
    /// Number of transfers the application is willing to accept
    pub const XFERCOUNT: Self = Self(0x0001);
    /// Compression scheme
    pub const ICAP_COMPRESSION: Self = Self(0x0100);
    /// Pixel type
    pub const ICAP_PIXELTYPE: Self = Self(0x0101);
    /// Unit of measure
    pub const ICAP_UNITS: Self = Self(0x0102);
    /// Transfer mechanism
    pub const ICAP_XFERMECH: Self = Self(0x0103);
    /// Author string
    pub const CAP_AUTHOR: Self = Self(0x1000);
    /// Caption string
    pub const CAP_CAPTION: Self = Self(0x1001);
    /// Document feeder enabled
    pub const CAP_FEEDERENABLED: Self = Self(0x1002);
    /// Document feeder loaded
    pub const CAP_FEEDERLOADED: Self = Self(0x1003);
    /// Capabilities the source supports
    pub const CAP_SUPPORTEDCAPS: Self = Self(0x1005);
    /// Capabilities negotiable while enabled
    pub const CAP_EXTENDEDCAPS: Self = Self(0x1006);
    /// Automatic feeding
    pub const CAP_AUTOFEED: Self = Self(0x1007);
    /// Progress indicators
    pub const CAP_INDICATORS: Self = Self(0x100b);
    /// Source user interface is controllable
    pub const CAP_UICONTROLLABLE: Self = Self(0x100e);
    /// Device online
    pub const CAP_DEVICEONLINE: Self = Self(0x100f);
    /// Duplex supported
    pub const CAP_DUPLEX: Self = Self(0x1012);
    /// Duplex enabled
    pub const CAP_DUPLEXENABLED: Self = Self(0x1013);
    /// Enabling the UI only is supported
    pub const CAP_ENABLEDSUIONLY: Self = Self(0x1014);
    /// Device events the application wants
    pub const CAP_DEVICEEVENT: Self = Self(0x1022);
    /// Number of sheets to scan (2.x)
    pub const CAP_SHEETCOUNT: Self = Self(0x103a);
    /// Horizontal resolution
    pub const ICAP_XRESOLUTION: Self = Self(0x1118);
    /// Vertical resolution
    pub const ICAP_YRESOLUTION: Self = Self(0x1119);
    /// Horizontal scaling
    pub const ICAP_XSCALING: Self = Self(0x1124);
    /// Vertical scaling
    pub const ICAP_YSCALING: Self = Self(0x1125);
    /// Bit depth
    pub const ICAP_BITDEPTH: Self = Self(0x112b);
    /// Image file format
    pub const ICAP_IMAGEFILEFORMAT: Self = Self(0x110c);
    /// Audio transfer mechanism
    pub const ACAP_XFERMECH: Self = Self(0x1202);

    /// Item type the capability is normally negotiated with, if well known.
    pub fn default_item_type(self) -> Option<ItemType> {
        let item = match self {
            Self::XFERCOUNT => ItemType::Int16,
            Self::ICAP_COMPRESSION
            | Self::ICAP_PIXELTYPE
            | Self::ICAP_UNITS
            | Self::ICAP_XFERMECH
            | Self::ICAP_BITDEPTH
            | Self::ICAP_IMAGEFILEFORMAT
            | Self::ACAP_XFERMECH
            | Self::CAP_SUPPORTEDCAPS
            | Self::CAP_EXTENDEDCAPS
            | Self::CAP_DUPLEX
            | Self::CAP_DEVICEEVENT => ItemType::UInt16,
            Self::CAP_AUTHOR => ItemType::Str128,
            Self::CAP_CAPTION => ItemType::Str255,
            Self::CAP_FEEDERENABLED
            | Self::CAP_FEEDERLOADED
            | Self::CAP_AUTOFEED
            | Self::CAP_INDICATORS
            | Self::CAP_UICONTROLLABLE
            | Self::CAP_DEVICEONLINE
            | Self::CAP_DUPLEXENABLED
            | Self::CAP_ENABLEDSUIONLY => ItemType::Bool,
            Self::CAP_SHEETCOUNT => ItemType::UInt32,
            Self::ICAP_XRESOLUTION
            | Self::ICAP_YRESOLUTION
            | Self::ICAP_XSCALING
            | Self::ICAP_YSCALING => ItemType::Fix32,
            _ => return None,
        };
        Some(item)
    }

    /// Vendor-defined capability.
    pub fn is_custom(self) -> bool {
        self.0 >= 0x8000
    }
}

impl fmt::Debug for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cap(0x{:04x})", self.0)
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

bitflags! {
    /// Operations a source reports as supported for one capability.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct QuerySupport: u32 {
        /// Get
        const GET = 0x0001;
        /// Set
        const SET = 0x0002;
        /// GetDefault
        const GET_DEFAULT = 0x0004;
        /// GetCurrent
        const GET_CURRENT = 0x0008;
        /// Reset
        const RESET = 0x0010;
        /// SetConstraint
        const SET_CONSTRAINT = 0x0020;
        /// Value can be constrained
        const CONSTRAINABLE = 0x0040;
        /// GetHelp
        const GET_HELP = 0x0100;
        /// GetLabel
        const GET_LABEL = 0x0200;
        /// GetLabelEnum
        const GET_LABEL_ENUM = 0x0400;
    }
}
