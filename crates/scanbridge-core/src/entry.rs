//! The driver entry point and the payloads it exchanges.
//!
//! The broker exposes exactly one call. Everything the client does is a
//! parameterized invocation of it, with the data-argument type fixing the
//! shape of the payload. Instead of one type per (group, argument, message)
//! combination there is one [`Payload`] enum plus a registry
//! ([`PayloadKind::for_argument`]) that says which variant each argument
//! type carries.

use std::{fmt, sync::Arc};

use scanbridge_proto::{
    DataArgType, DataGroup, Identity, Msg,
    payloads::{
        AudioInfo, CapabilityRecord, DeviceEvent, ImageInfo, ImageLayout, ImageMemXfer, MemHandle,
        PendingXfers, SetupFileXfer, SetupMemXfer, Status, StatusText, UserInterface,
    },
};

use crate::{events::EventSender, memory::MemoryBroker};

/// The broker's single entry point.
///
/// Implementations must tolerate being called from a watchdog worker
/// thread. A panic inside `call` is treated as a driver fault.
pub trait DriverEntry: Send + Sync {
    /// Execute one triplet and return the raw return code.
    ///
    /// `origin` is writable because opening the broker assigns the
    /// application its id through it.
    fn call(
        &self,
        origin: &mut Identity,
        dest: Option<&Identity>,
        group: DataGroup,
        dat: DataArgType,
        msg: Msg,
        payload: &mut Payload,
    ) -> u16;
}

/// Raw host message offered to a legacy source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformEvent {
    /// Host message, opaque to the client
    pub raw: u64,
    /// Message the source extracted from it, [`Msg::NULL`] if none
    pub message: Msg,
}

/// Payload of one triplet, tagged by the record it carries.
#[derive(Debug, Default)]
pub enum Payload {
    /// No payload
    #[default]
    None,
    /// Application or source identity
    Identity(Identity),
    /// Capability record
    Capability(CapabilityRecord),
    /// Condition code
    Status(Status),
    /// Condition code with explanation
    StatusText(StatusText),
    /// User interface control
    UserInterface(UserInterface),
    /// Pending transfer count
    PendingXfers(PendingXfers),
    /// Image metadata
    ImageInfo(ImageInfo),
    /// Image layout
    ImageLayout(ImageLayout),
    /// Buffered transfer sizes
    SetupMemXfer(SetupMemXfer),
    /// One buffered strip
    ImageMemXfer(ImageMemXfer),
    /// File transfer destination
    SetupFileXfer(SetupFileXfer),
    /// Native transfer handle, filled by the source
    NativeXfer(Option<MemHandle>),
    /// Legacy host event
    Event(PlatformEvent),
    /// Device event details
    DeviceEvent(DeviceEvent),
    /// Negotiated memory table, filled by the broker
    EntryPoint(Option<Arc<dyn MemoryBroker>>),
    /// Parent window handle
    Parent(u64),
    /// Event channel for 2.x sources
    Callback(EventSender),
    /// Audio metadata
    AudioInfo(AudioInfo),
}

/// Discriminant of a [`Payload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// [`Payload::None`]
    None,
    /// [`Payload::Identity`]
    Identity,
    /// [`Payload::Capability`]
    Capability,
    /// [`Payload::Status`]
    Status,
    /// [`Payload::StatusText`]
    StatusText,
    /// [`Payload::UserInterface`]
    UserInterface,
    /// [`Payload::PendingXfers`]
    PendingXfers,
    /// [`Payload::ImageInfo`]
    ImageInfo,
    /// [`Payload::ImageLayout`]
    ImageLayout,
    /// [`Payload::SetupMemXfer`]
    SetupMemXfer,
    /// [`Payload::ImageMemXfer`]
    ImageMemXfer,
    /// [`Payload::SetupFileXfer`]
    SetupFileXfer,
    /// [`Payload::NativeXfer`]
    NativeXfer,
    /// [`Payload::Event`]
    Event,
    /// [`Payload::DeviceEvent`]
    DeviceEvent,
    /// [`Payload::EntryPoint`]
    EntryPoint,
    /// [`Payload::Parent`]
    Parent,
    /// [`Payload::Callback`]
    Callback,
    /// [`Payload::AudioInfo`]
    AudioInfo,
}

impl PayloadKind {
    /// Payload kind registered for an argument type.
    pub fn for_argument(dat: DataArgType) -> Option<Self> {
        let kind = match dat {
            DataArgType::NULL | DataArgType::IMAGEFILEXFER | DataArgType::AUDIOFILEXFER => {
                Self::None
            },
            DataArgType::CAPABILITY => Self::Capability,
            DataArgType::EVENT => Self::Event,
            DataArgType::IDENTITY => Self::Identity,
            DataArgType::PARENT => Self::Parent,
            DataArgType::PENDINGXFERS => Self::PendingXfers,
            DataArgType::SETUPMEMXFER => Self::SetupMemXfer,
            DataArgType::SETUPFILEXFER => Self::SetupFileXfer,
            DataArgType::STATUS => Self::Status,
            DataArgType::STATUSUTF8 => Self::StatusText,
            DataArgType::USERINTERFACE => Self::UserInterface,
            DataArgType::DEVICEEVENT => Self::DeviceEvent,
            DataArgType::CALLBACK => Self::Callback,
            DataArgType::ENTRYPOINT => Self::EntryPoint,
            DataArgType::IMAGEINFO => Self::ImageInfo,
            DataArgType::IMAGELAYOUT => Self::ImageLayout,
            DataArgType::IMAGEMEMXFER => Self::ImageMemXfer,
            DataArgType::IMAGENATIVEXFER | DataArgType::AUDIONATIVEXFER => Self::NativeXfer,
            DataArgType::AUDIOINFO => Self::AudioInfo,
            _ => return None,
        };
        Some(kind)
    }
}

impl Payload {
    /// Discriminant of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::None => PayloadKind::None,
            Self::Identity(_) => PayloadKind::Identity,
            Self::Capability(_) => PayloadKind::Capability,
            Self::Status(_) => PayloadKind::Status,
            Self::StatusText(_) => PayloadKind::StatusText,
            Self::UserInterface(_) => PayloadKind::UserInterface,
            Self::PendingXfers(_) => PayloadKind::PendingXfers,
            Self::ImageInfo(_) => PayloadKind::ImageInfo,
            Self::ImageLayout(_) => PayloadKind::ImageLayout,
            Self::SetupMemXfer(_) => PayloadKind::SetupMemXfer,
            Self::ImageMemXfer(_) => PayloadKind::ImageMemXfer,
            Self::SetupFileXfer(_) => PayloadKind::SetupFileXfer,
            Self::NativeXfer(_) => PayloadKind::NativeXfer,
            Self::Event(_) => PayloadKind::Event,
            Self::DeviceEvent(_) => PayloadKind::DeviceEvent,
            Self::EntryPoint(_) => PayloadKind::EntryPoint,
            Self::Parent(_) => PayloadKind::Parent,
            Self::Callback(_) => PayloadKind::Callback,
            Self::AudioInfo(_) => PayloadKind::AudioInfo,
        }
    }
}

/// Compact one-line rendering for triplet logs.
pub(crate) struct PayloadSummary<'a>(pub &'a Payload);

impl fmt::Display for PayloadSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Payload::None => f.write_str("-"),
            Payload::Identity(id) => write!(f, "id={} {:?}", id.id, id.product_name),
            Payload::Capability(record) => {
                write!(f, "cap={} con=0x{:04x} buf={:?}", record.cap, record.con_type, record.container)
            },
            Payload::Status(status) => write!(f, "cc={:?}", status.condition),
            Payload::StatusText(text) => write!(f, "cc={:?} {:?}", text.status.condition, text.text),
            Payload::UserInterface(ui) => write!(f, "show={} modal={}", ui.show_ui, ui.modal_ui),
            Payload::PendingXfers(pending) => write!(f, "count={}", pending.count),
            Payload::ImageInfo(info) => {
                write!(f, "{}x{} bpp={}", info.image_width, info.image_length, info.bits_per_pixel)
            },
            Payload::ImageLayout(layout) => write!(f, "frame={:?}", layout.frame),
            Payload::SetupMemXfer(setup) => {
                write!(f, "min={} max={} pref={}", setup.min_buf_size, setup.max_buf_size, setup.preferred)
            },
            Payload::ImageMemXfer(strip) => {
                write!(f, "rows={} written={}", strip.rows, strip.bytes_written)
            },
            Payload::SetupFileXfer(setup) => write!(f, "{} {:?}", setup.path.display(), setup.format),
            Payload::NativeXfer(handle) => write!(f, "handle={handle:?}"),
            Payload::Event(event) => write!(f, "raw={} msg={:?}", event.raw, event.message),
            Payload::DeviceEvent(event) => write!(f, "{:?} {:?}", event.kind, event.device_name),
            Payload::EntryPoint(memory) => write!(f, "memory={}", memory.is_some()),
            Payload::Parent(parent) => write!(f, "parent=0x{parent:x}"),
            Payload::Callback(_) => f.write_str("callback"),
            Payload::AudioInfo(info) => write!(f, "{:?}", info.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use scanbridge_proto::CapabilityId;

    use super::*;

    #[test]
    fn registry_matches_payload_variants() {
        let payload = Payload::Capability(CapabilityRecord::request(CapabilityId::XFERCOUNT));
        assert_eq!(PayloadKind::for_argument(DataArgType::CAPABILITY), Some(payload.kind()));
        assert_eq!(PayloadKind::for_argument(DataArgType::IMAGEFILEXFER), Some(PayloadKind::None));
        assert_eq!(
            PayloadKind::for_argument(DataArgType::AUDIONATIVEXFER),
            Some(PayloadKind::NativeXfer)
        );
    }

    #[test]
    fn unregistered_argument_has_no_kind() {
        assert_eq!(PayloadKind::for_argument(DataArgType::XFERGROUP), None);
        assert_eq!(PayloadKind::for_argument(DataArgType(0x7777)), None);
    }
}
