//! Control-group payload records.

use serde::{Deserialize, Serialize};

use crate::{CapabilityId, ConditionCode, ContainerShape, MemHandle, container::DONTCARE16};

/// Capability request/response record.
///
/// For Get-class messages the application sends `shape = None` and no
/// container; the source fills both. For Set-class messages the application
/// supplies both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Capability addressed
    pub cap: CapabilityId,
    /// Raw shape tag, [`DONTCARE16`] when unspecified
    pub con_type: u16,
    /// Container buffer
    pub container: Option<MemHandle>,
}

impl CapabilityRecord {
    /// Request record for Get-class messages.
    pub fn request(cap: CapabilityId) -> Self {
        Self { cap, con_type: DONTCARE16, container: None }
    }

    /// Record carrying an application-built container.
    pub fn with_container(cap: CapabilityId, shape: ContainerShape, handle: MemHandle) -> Self {
        Self { cap, con_type: shape.to_u16(), container: Some(handle) }
    }
}

/// User interface control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserInterface {
    /// Show the source's own interface
    pub show_ui: bool,
    /// Run the interface modally
    pub modal_ui: bool,
    /// Parent window handle
    pub parent: u64,
}

/// Pending transfer count after an end-transfer or reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingXfers {
    /// Remaining transfers, `-1` when unknown (feeder-driven)
    pub count: i16,
    /// End-of-job marker
    pub end_of_job: u32,
}

impl PendingXfers {
    /// More transfers are coming (including the unknown-count case).
    pub fn has_more(&self) -> bool {
        self.count != 0
    }
}

/// Condition code reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Condition code
    pub condition: ConditionCode,
    /// Source-specific extra data
    pub data: u16,
}

impl Default for Status {
    fn default() -> Self {
        Self { condition: ConditionCode::Success, data: 0 }
    }
}

/// Condition code with a UTF-8 explanation (2.x sources).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusText {
    /// Status the text explains
    pub status: Status,
    /// Explanation text
    pub text: String,
}

/// Kind of device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceEventKind {
    /// Device-specific check
    CheckAutomaticCapture,
    /// Battery level changed
    CheckBattery,
    /// Device came online or went offline
    CheckDeviceOnline,
    /// Flash state changed
    CheckFlash,
    /// Power supply changed
    CheckPowerSupply,
    /// Resolution changed
    CheckResolution,
    /// Device added
    DeviceAdded,
    /// Device offline
    DeviceOffline,
    /// Device ready
    DeviceReady,
    /// Device removed
    DeviceRemoved,
    /// Image captured
    ImageCaptured,
    /// Image deleted
    ImageDeleted,
    /// Paper double feed
    PaperDoubleFeed,
    /// Paper jam
    PaperJam,
    /// Lamp failure
    LampFailure,
    /// Power save mode
    PowerSave,
    /// Power save notification
    PowerSaveNotify,
    /// Any other raw code
    Other(u16),
}

impl DeviceEventKind {
    /// Parse a raw event code.
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::CheckAutomaticCapture,
            1 => Self::CheckBattery,
            2 => Self::CheckDeviceOnline,
            3 => Self::CheckFlash,
            4 => Self::CheckPowerSupply,
            5 => Self::CheckResolution,
            6 => Self::DeviceAdded,
            7 => Self::DeviceOffline,
            8 => Self::DeviceReady,
            9 => Self::DeviceRemoved,
            10 => Self::ImageCaptured,
            11 => Self::ImageDeleted,
            12 => Self::PaperDoubleFeed,
            13 => Self::PaperJam,
            14 => Self::LampFailure,
            15 => Self::PowerSave,
            16 => Self::PowerSaveNotify,
            other => Self::Other(other),
        }
    }
}

/// Device event details fetched after a device-event notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    /// What happened
    pub kind: DeviceEventKind,
    /// Device name
    pub device_name: String,
    /// Battery minutes remaining
    pub battery_minutes: u32,
    /// Battery percentage remaining
    pub battery_percentage: i16,
    /// Power supply state
    pub power_supply: i32,
    /// Horizontal resolution
    pub x_resolution: f64,
    /// Vertical resolution
    pub y_resolution: f64,
    /// Flash state
    pub flash_used: u32,
    /// Automatic capture count
    pub automatic_capture: u32,
    /// Milliseconds before the first automatic capture
    pub time_before_first_capture: u32,
    /// Milliseconds between automatic captures
    pub time_between_captures: u32,
}

impl Default for DeviceEvent {
    fn default() -> Self {
        Self {
            kind: DeviceEventKind::Other(0xffff),
            device_name: String::new(),
            battery_minutes: 0,
            battery_percentage: 0,
            power_supply: 0,
            x_resolution: 0.0,
            y_resolution: 0.0,
            flash_used: 0,
            automatic_capture: 0,
            time_before_first_capture: 0,
            time_between_captures: 0,
        }
    }
}
