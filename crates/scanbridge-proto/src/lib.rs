//! Wire format for the scanbridge acquisition client.
//!
//! Every device operation is one invocation of the broker's single entry
//! point, addressed by three integer codes: the data group (DG), the
//! data-argument type (DAT) and the message (MSG). This crate names those
//! codes, the return and condition codes that come back, and the byte
//! layouts the broker and application exchange through memory handles.
//!
//! Capability values travel in one of four container shapes (OneValue,
//! Array, Enumeration, Range). Each container starts with a fixed
//! little-endian header followed by items whose width is determined by the
//! item type. Resolution and coordinate values use a 16.16 fixed-point
//! format (FIX32) on the wire and are surfaced as `f64` everywhere else.
//!
//! # Security
//!
//! All header parsing goes through `zerocopy` layouts with explicit length
//! checks. Decoding never trusts an item count without checking it against
//! the buffer length first.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capability;
pub mod codes;
pub mod container;
pub mod errors;
pub mod fix32;
pub mod identity;
pub mod item;
pub mod payloads;

pub use capability::{CapabilityId, QuerySupport};
pub use codes::{ConditionCode, DataArgType, DataGroup, Msg, ReturnCode};
pub use container::{Container, ContainerShape, RangeRecord};
pub use errors::{ProtocolError, Result};
pub use fix32::Fix32;
pub use identity::{Identity, SupportedGroups, Version};
pub use item::{CapValue, Frame, ItemType};
pub use payloads::MemHandle;
