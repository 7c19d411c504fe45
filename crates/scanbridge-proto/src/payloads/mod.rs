//! Typed payload records carried by triplets.
//!
//! Each data-argument type has exactly one record shape. Memory that must
//! outlive a single call (capability containers, native images, buffered
//! strips) is referenced by [`MemHandle`] and owned through the memory
//! broker, never embedded in the record.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod audio;
pub mod control;
pub mod image;

pub use audio::AudioInfo;
pub use control::{
    CapabilityRecord, DeviceEvent, DeviceEventKind, PendingXfers, Status, StatusText,
    UserInterface,
};
pub use image::{
    FileFormat, ImageInfo, ImageLayout, ImageMemXfer, MemoryFlags, SetupFileXfer, SetupMemXfer,
};

/// Opaque handle to a block owned by a memory broker.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemHandle(pub u64);

impl fmt::Debug for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemHandle(0x{:x})", self.0)
    }
}
