//! Operation addressing codes and result codes.
//!
//! A triplet is addressed by `(DataGroup, DataArgType, Msg)`. Data-argument
//! types and messages are open sets (vendors define custom values above
//! `0x8000`), so they are newtypes with associated constants rather than
//! closed enums. Data groups are a closed set.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// Target group of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u32)]
pub enum DataGroup {
    /// Session, identity, capability and transfer control
    Control = 0x0001,
    /// Image metadata and image transfers
    Image = 0x0002,
    /// Audio metadata and audio transfers
    Audio = 0x0004,
}

impl DataGroup {
    /// Raw wire value.
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a raw wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Control),
            0x0002 => Some(Self::Image),
            0x0004 => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Data-argument type: selects the payload record an operation carries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataArgType(pub u16);

impl DataArgType {
    /// No payload
    pub const NULL: Self = Self(0x0000);
    /// Capability container
    pub const CAPABILITY: Self = Self(0x0001);
    /// Event routing (legacy message loop)
    pub const EVENT: Self = Self(0x0002);
    /// Application or source identity
    pub const IDENTITY: Self = Self(0x0003);
    /// Parent window handle (broker open/close)
    pub const PARENT: Self = Self(0x0004);
    /// Pending transfer count
    pub const PENDINGXFERS: Self = Self(0x0005);
    /// Buffered transfer size negotiation
    pub const SETUPMEMXFER: Self = Self(0x0006);
    /// File transfer destination
    pub const SETUPFILEXFER: Self = Self(0x0007);
    /// Condition code
    pub const STATUS: Self = Self(0x0008);
    /// User interface control
    pub const USERINTERFACE: Self = Self(0x0009);
    /// Transfer group selection
    pub const XFERGROUP: Self = Self(0x000a);
    /// Device event payload
    pub const DEVICEEVENT: Self = Self(0x000d);
    /// Callback registration (2.x)
    pub const CALLBACK: Self = Self(0x0010);
    /// Condition code with UTF-8 text (2.x)
    pub const STATUSUTF8: Self = Self(0x0011);
    /// Image metadata
    pub const IMAGEINFO: Self = Self(0x0101);
    /// Image layout frame
    pub const IMAGELAYOUT: Self = Self(0x0102);
    /// Buffered image transfer
    pub const IMAGEMEMXFER: Self = Self(0x0103);
    /// Native image transfer
    pub const IMAGENATIVEXFER: Self = Self(0x0104);
    /// File image transfer
    pub const IMAGEFILEXFER: Self = Self(0x0105);
    /// Audio file transfer
    pub const AUDIOFILEXFER: Self = Self(0x0201);
    /// Audio metadata
    pub const AUDIOINFO: Self = Self(0x0202);
    /// Audio native transfer
    pub const AUDIONATIVEXFER: Self = Self(0x0203);
    /// Memory entry-point negotiation (2.x)
    pub const ENTRYPOINT: Self = Self(0x0403);

    /// Symbolic name, if the code is a known one.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NULL => "NULL",
            Self::CAPABILITY => "CAPABILITY",
            Self::EVENT => "EVENT",
            Self::IDENTITY => "IDENTITY",
            Self::PARENT => "PARENT",
            Self::PENDINGXFERS => "PENDINGXFERS",
            Self::SETUPMEMXFER => "SETUPMEMXFER",
            Self::SETUPFILEXFER => "SETUPFILEXFER",
            Self::STATUS => "STATUS",
            Self::USERINTERFACE => "USERINTERFACE",
            Self::XFERGROUP => "XFERGROUP",
            Self::DEVICEEVENT => "DEVICEEVENT",
            Self::CALLBACK => "CALLBACK",
            Self::STATUSUTF8 => "STATUSUTF8",
            Self::IMAGEINFO => "IMAGEINFO",
            Self::IMAGELAYOUT => "IMAGELAYOUT",
            Self::IMAGEMEMXFER => "IMAGEMEMXFER",
            Self::IMAGENATIVEXFER => "IMAGENATIVEXFER",
            Self::IMAGEFILEXFER => "IMAGEFILEXFER",
            Self::AUDIOFILEXFER => "AUDIOFILEXFER",
            Self::AUDIOINFO => "AUDIOINFO",
            Self::AUDIONATIVEXFER => "AUDIONATIVEXFER",
            Self::ENTRYPOINT => "ENTRYPOINT",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for DataArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "DAT_{name}"),
            None => write!(f, "DAT(0x{:04x})", self.0),
        }
    }
}

/// Message: the verb applied to a data-argument type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Msg(pub u16);

impl Msg {
    /// No message (also the "nothing to report" event)
    pub const NULL: Self = Self(0x0000);
    /// Read all values
    pub const GET: Self = Self(0x0001);
    /// Read current value
    pub const GETCURRENT: Self = Self(0x0002);
    /// Read power-on default
    pub const GETDEFAULT: Self = Self(0x0003);
    /// First item of an enumeration
    pub const GETFIRST: Self = Self(0x0004);
    /// Next item of an enumeration
    pub const GETNEXT: Self = Self(0x0005);
    /// Write a value
    pub const SET: Self = Self(0x0006);
    /// Restore a default
    pub const RESET: Self = Self(0x0007);
    /// Ask which messages a capability supports
    pub const QUERYSUPPORT: Self = Self(0x0008);
    /// Restrict the allowed values of a capability
    pub const SETCONSTRAINT: Self = Self(0x000c);
    /// Source is ready to transfer
    pub const XFERREADY: Self = Self(0x0101);
    /// Source asks to be closed
    pub const CLOSEDSREQ: Self = Self(0x0102);
    /// Source confirms settings in UI-only mode
    pub const CLOSEDSOK: Self = Self(0x0103);
    /// Device event is waiting
    pub const DEVICEEVENT: Self = Self(0x0104);
    /// Open the broker
    pub const OPENDSM: Self = Self(0x0301);
    /// Close the broker
    pub const CLOSEDSM: Self = Self(0x0302);
    /// Open a source
    pub const OPENDS: Self = Self(0x0401);
    /// Close a source
    pub const CLOSEDS: Self = Self(0x0402);
    /// Show the broker's source selection dialog
    pub const USERSELECT: Self = Self(0x0403);
    /// Disable the source user interface
    pub const DISABLEDS: Self = Self(0x0501);
    /// Enable the source for acquisition
    pub const ENABLEDS: Self = Self(0x0502);
    /// Enable the source user interface for settings only
    pub const ENABLEDSUIONLY: Self = Self(0x0503);
    /// Offer a platform message to the source (legacy event path)
    pub const PROCESSEVENT: Self = Self(0x0601);
    /// Finish the current transfer
    pub const ENDXFER: Self = Self(0x0701);
    /// Stop the document feeder
    pub const STOPFEEDER: Self = Self(0x0702);
    /// Register an event callback (2.x)
    pub const REGISTER_CALLBACK: Self = Self(0x0902);
    /// Reset every capability
    pub const RESETALL: Self = Self(0x0a01);

    /// Symbolic name, if the code is a known one.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NULL => "NULL",
            Self::GET => "GET",
            Self::GETCURRENT => "GETCURRENT",
            Self::GETDEFAULT => "GETDEFAULT",
            Self::GETFIRST => "GETFIRST",
            Self::GETNEXT => "GETNEXT",
            Self::SET => "SET",
            Self::RESET => "RESET",
            Self::QUERYSUPPORT => "QUERYSUPPORT",
            Self::SETCONSTRAINT => "SETCONSTRAINT",
            Self::XFERREADY => "XFERREADY",
            Self::CLOSEDSREQ => "CLOSEDSREQ",
            Self::CLOSEDSOK => "CLOSEDSOK",
            Self::DEVICEEVENT => "DEVICEEVENT",
            Self::OPENDSM => "OPENDSM",
            Self::CLOSEDSM => "CLOSEDSM",
            Self::OPENDS => "OPENDS",
            Self::CLOSEDS => "CLOSEDS",
            Self::USERSELECT => "USERSELECT",
            Self::DISABLEDS => "DISABLEDS",
            Self::ENABLEDS => "ENABLEDS",
            Self::ENABLEDSUIONLY => "ENABLEDSUIONLY",
            Self::PROCESSEVENT => "PROCESSEVENT",
            Self::ENDXFER => "ENDXFER",
            Self::STOPFEEDER => "STOPFEEDER",
            Self::REGISTER_CALLBACK => "REGISTER_CALLBACK",
            Self::RESETALL => "RESETALL",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "MSG_{name}"),
            None => write!(f, "MSG(0x{:04x})", self.0),
        }
    }
}

/// Primary result of one entry-point invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    /// Operation succeeded
    Success,
    /// Operation failed; fetch the condition code for details
    Failure,
    /// Partially succeeded; the source changed something the caller asked for
    CheckStatus,
    /// User or source cancelled
    Cancel,
    /// Message belonged to the source (legacy event path)
    DsEvent,
    /// Message did not belong to the source (legacy event path)
    NotDsEvent,
    /// Transfer finished
    XferDone,
    /// Enumeration exhausted
    EndOfList,
    /// Requested metadata is not supported
    InfoNotSupported,
    /// Requested data is not available
    DataNotAvailable,
    /// Device is busy
    Busy,
    /// Scanner is locked by another session
    ScannerLocked,
    /// Any other raw code
    Other(u16),
}

impl ReturnCode {
    /// Parse a raw return code.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::Failure,
            2 => Self::CheckStatus,
            3 => Self::Cancel,
            4 => Self::DsEvent,
            5 => Self::NotDsEvent,
            6 => Self::XferDone,
            7 => Self::EndOfList,
            8 => Self::InfoNotSupported,
            9 => Self::DataNotAvailable,
            10 => Self::Busy,
            11 => Self::ScannerLocked,
            other => Self::Other(other),
        }
    }

    /// Raw wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::CheckStatus => 2,
            Self::Cancel => 3,
            Self::DsEvent => 4,
            Self::NotDsEvent => 5,
            Self::XferDone => 6,
            Self::EndOfList => 7,
            Self::InfoNotSupported => 8,
            Self::DataNotAvailable => 9,
            Self::Busy => 10,
            Self::ScannerLocked => 11,
            Self::Other(other) => other,
        }
    }

    /// Success or CheckStatus: the operation took effect.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::CheckStatus)
    }
}

/// Secondary error code fetched with a status query after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionCode {
    /// No error
    Success,
    /// Unspecified failure
    Bummer,
    /// Not enough memory
    LowMemory,
    /// No source available
    NoDs,
    /// Source already in use by another application
    MaxConnections,
    /// Operation failed inside the source
    OperationError,
    /// Unknown capability
    BadCap,
    /// Unrecognized triplet
    BadProtocol,
    /// Value out of range
    BadValue,
    /// Operation out of sequence
    SeqError,
    /// Unknown destination identity
    BadDest,
    /// Capability not supported
    CapUnsupported,
    /// Operation not supported by the capability
    CapBadOperation,
    /// Capability depends on another capability
    CapSeqError,
    /// Access denied
    Denied,
    /// File already exists
    FileExists,
    /// File not found
    FileNotFound,
    /// Directory not empty
    NotEmpty,
    /// Paper jam
    PaperJam,
    /// Double feed detected
    PaperDoubleFeed,
    /// Could not write the file
    FileWriteError,
    /// Device went offline
    CheckDeviceOnline,
    /// Cover or interlock open
    Interlock,
    /// Damaged corner detected
    DamagedCorner,
    /// Focus error
    FocusError,
    /// Document too light
    DocTooLight,
    /// Document too dark
    DocTooDark,
    /// No media in the feeder
    NoMedia,
    /// Any other raw code
    Other(u16),
}

impl ConditionCode {
    /// Parse a raw condition code.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::Bummer,
            2 => Self::LowMemory,
            3 => Self::NoDs,
            4 => Self::MaxConnections,
            5 => Self::OperationError,
            6 => Self::BadCap,
            9 => Self::BadProtocol,
            10 => Self::BadValue,
            11 => Self::SeqError,
            12 => Self::BadDest,
            13 => Self::CapUnsupported,
            14 => Self::CapBadOperation,
            15 => Self::CapSeqError,
            16 => Self::Denied,
            17 => Self::FileExists,
            18 => Self::FileNotFound,
            19 => Self::NotEmpty,
            20 => Self::PaperJam,
            21 => Self::PaperDoubleFeed,
            22 => Self::FileWriteError,
            23 => Self::CheckDeviceOnline,
            24 => Self::Interlock,
            25 => Self::DamagedCorner,
            26 => Self::FocusError,
            27 => Self::DocTooLight,
            28 => Self::DocTooDark,
            29 => Self::NoMedia,
            other => Self::Other(other),
        }
    }

    /// Raw wire value.
    pub fn to_u16(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::Bummer => 1,
            Self::LowMemory => 2,
            Self::NoDs => 3,
            Self::MaxConnections => 4,
            Self::OperationError => 5,
            Self::BadCap => 6,
            Self::BadProtocol => 9,
            Self::BadValue => 10,
            Self::SeqError => 11,
            Self::BadDest => 12,
            Self::CapUnsupported => 13,
            Self::CapBadOperation => 14,
            Self::CapSeqError => 15,
            Self::Denied => 16,
            Self::FileExists => 17,
            Self::FileNotFound => 18,
            Self::NotEmpty => 19,
            Self::PaperJam => 20,
            Self::PaperDoubleFeed => 21,
            Self::FileWriteError => 22,
            Self::CheckDeviceOnline => 23,
            Self::Interlock => 24,
            Self::DamagedCorner => 25,
            Self::FocusError => 26,
            Self::DocTooLight => 27,
            Self::DocTooDark => 28,
            Self::NoMedia => 29,
            Self::Other(other) => other,
        }
    }

    /// Fixed diagnostic text for this condition.
    pub fn description(self) -> &'static str {
        match self {
            Self::Success => "no error",
            Self::Bummer => "failure due to unknown causes",
            Self::LowMemory => "not enough memory to perform the operation",
            Self::NoDs => "no data source available",
            Self::MaxConnections => "data source is connected to the maximum number of applications",
            Self::OperationError => "data source or broker reported an error, the user was notified",
            Self::BadCap => "unknown capability",
            Self::BadProtocol => "unrecognized data group / argument type / message combination",
            Self::BadValue => "data parameter out of range",
            Self::SeqError => "operation invalid in the current state",
            Self::BadDest => "unknown destination identity",
            Self::CapUnsupported => "capability not supported by the source",
            Self::CapBadOperation => "operation not supported by the capability",
            Self::CapSeqError => "capability has a dependency on another capability",
            Self::Denied => "file system operation denied",
            Self::FileExists => "file system operation failed because the file exists",
            Self::FileNotFound => "file not found",
            Self::NotEmpty => "directory is not empty",
            Self::PaperJam => "feeder is jammed",
            Self::PaperDoubleFeed => "feeder detected multiple pages",
            Self::FileWriteError => "error writing the file",
            Self::CheckDeviceOnline => "device went offline prior to or during the operation",
            Self::Interlock => "cover or door is open",
            Self::DamagedCorner => "document has a damaged corner",
            Self::FocusError => "focusing error during document capture",
            Self::DocTooLight => "document is too light",
            Self::DocTooDark => "document is too dark",
            Self::NoMedia => "no media in the feeder",
            Self::Other(_) => "unrecognized condition code",
        }
    }
}

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.to_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_round_trip_through_raw_values() {
        for raw in 0..=12u16 {
            assert_eq!(ReturnCode::from_u16(raw).to_u16(), raw);
        }
        assert_eq!(ReturnCode::from_u16(0x4000), ReturnCode::Other(0x4000));
    }

    #[test]
    fn check_status_counts_as_success() {
        assert!(ReturnCode::CheckStatus.is_success());
        assert!(!ReturnCode::Failure.is_success());
        assert!(!ReturnCode::Cancel.is_success());
    }

    #[test]
    fn condition_table_covers_known_codes() {
        for raw in 0..=29u16 {
            let code = ConditionCode::from_u16(raw);
            if matches!(raw, 7 | 8) {
                assert_eq!(code, ConditionCode::Other(raw));
            } else {
                assert_ne!(code.description(), "unrecognized condition code");
                assert_eq!(code.to_u16(), raw);
            }
        }
    }

    #[test]
    fn debug_names_known_codes() {
        assert_eq!(format!("{:?}", DataArgType::CAPABILITY), "DAT_CAPABILITY");
        assert_eq!(format!("{:?}", Msg::ENABLEDS), "MSG_ENABLEDS");
        assert_eq!(format!("{:?}", Msg(0x8001)), "MSG(0x8001)");
    }
}
