//! Error types for the acquisition engine.
//!
//! Errors are layered the way calls are layered: the dispatcher reports
//! [`DispatchError`], memory brokers report [`MemoryError`], capability
//! negotiation wraps both in [`CapabilityError`], and the per-device and
//! per-session surfaces wrap everything below them.

use std::time::Duration;

use scanbridge_proto::{
    CapabilityId, ConditionCode, DataArgType, Msg, ProtocolError, ReturnCode, payloads::MemHandle,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{entry::PayloadKind, state::SourceState};

/// Errors raised by the triplet dispatcher itself, before or instead of a
/// driver return code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The session the triplet was built against is no longer registered.
    #[error("triplet {dat:?}/{msg:?} not executed: session is closed")]
    TripletNotExecuted {
        /// Argument type of the rejected call
        dat: DataArgType,
        /// Message of the rejected call
        msg: Msg,
    },

    /// The driver faulted during the call.
    #[error("driver fault during {dat:?}/{msg:?}")]
    DriverFault {
        /// Argument type of the faulting call
        dat: DataArgType,
        /// Message of the faulting call
        msg: Msg,
    },

    /// The watchdog expired; the call is still outstanding.
    #[error("{dat:?}/{msg:?} timed out after {after:?}")]
    Timeout {
        /// Argument type of the abandoned call
        dat: DataArgType,
        /// Message of the abandoned call
        msg: Msg,
        /// Watchdog period
        after: Duration,
    },

    /// Payload does not match the argument type.
    #[error("{dat:?} expects a {expected:?} payload, got {found:?}")]
    PayloadMismatch {
        /// Argument type
        dat: DataArgType,
        /// Payload kind registered for the argument type
        expected: Option<PayloadKind>,
        /// Payload kind supplied
        found: PayloadKind,
    },
}

/// Memory broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Handle was never allocated or is already freed.
    #[error("unknown memory handle {0:?}")]
    UnknownHandle(MemHandle),

    /// Free requested while the block is still locked.
    #[error("{handle:?} freed while locked {locks} time(s)")]
    FreeWhileLocked {
        /// Block handle
        handle: MemHandle,
        /// Outstanding locks
        locks: u32,
    },

    /// Unlock requested on a block that is not locked.
    #[error("{0:?} unlocked without a matching lock")]
    NotLocked(MemHandle),

    /// Access outside the allocated block.
    #[error("{handle:?}: access of {len} bytes at {offset} exceeds block size {size}")]
    OutOfBounds {
        /// Block handle
        handle: MemHandle,
        /// Start offset
        offset: usize,
        /// Access length
        len: usize,
        /// Block size
        size: usize,
    },

    /// Allocation request the broker refused.
    #[error("allocation of {0} bytes refused")]
    AllocationFailed(usize),
}

/// Failure of a single capability operation.
///
/// Decode errors abort only the operation that produced them; the source's
/// state is untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// A Get-class call succeeded but returned no container.
    #[error("{0:?}: source reported success without a container")]
    NullContainer(CapabilityId),

    /// The effective item type has no known width.
    #[error("{cap:?}: unknown item type 0x{item_type:04x}")]
    UnknownItemType {
        /// Capability being decoded
        cap: CapabilityId,
        /// Raw effective item type
        item_type: u16,
    },

    /// The source rejected the operation.
    #[error("{cap:?}: {return_code:?} ({condition})")]
    Protocol {
        /// Capability addressed
        cap: CapabilityId,
        /// Return code of the capability triplet
        return_code: ReturnCode,
        /// Condition code fetched afterwards
        condition: ConditionCode,
    },

    /// The source does not support the capability.
    #[error("{0:?} is not supported by the source")]
    Unsupported(CapabilityId),

    /// The values cannot form the requested container shape.
    #[error("{cap:?}: {count} value(s) cannot form a {shape} container")]
    ValueCount {
        /// Capability being set
        cap: CapabilityId,
        /// Requested shape name
        shape: &'static str,
        /// Values supplied
        count: usize,
    },

    /// Container bytes could not be encoded or decoded.
    #[error("container codec: {0}")]
    Codec(#[from] ProtocolError),

    /// Container buffer handling failed.
    #[error("container buffer: {0}")]
    Memory(#[from] MemoryError),

    /// The capability triplet was not executed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Errors surfaced by a [`Source`](crate::source::Source).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Operation not valid in the current state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// Current state
        state: SourceState,
        /// Operation attempted
        operation: String,
    },

    /// The source returned a failure for a state-changing or transfer call.
    #[error("{dat:?}/{msg:?} returned {return_code:?} ({condition})")]
    Protocol {
        /// Argument type of the failing call
        dat: DataArgType,
        /// Message of the failing call
        msg: Msg,
        /// Return code
        return_code: ReturnCode,
        /// Condition code fetched afterwards
        condition: ConditionCode,
    },

    /// The triplet was not executed or did not return.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Capability negotiation failed.
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    /// Transfer buffer handling failed.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Reading or removing a transferred file failed.
    #[error("file transfer: {0}")]
    File(String),

    /// A call on this source timed out; the source is unusable.
    #[error("source is unusable after an abandoned call")]
    Poisoned,
}

/// Errors surfaced by a [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The broker refused to open.
    #[error("broker open failed: {return_code:?} ({condition})")]
    OpenFailed {
        /// Return code
        return_code: ReturnCode,
        /// Condition code fetched afterwards
        condition: ConditionCode,
    },

    /// A session-level call returned a failure.
    #[error("{dat:?}/{msg:?} returned {return_code:?} ({condition})")]
    Protocol {
        /// Argument type of the failing call
        dat: DataArgType,
        /// Message of the failing call
        msg: Msg,
        /// Return code
        return_code: ReturnCode,
        /// Condition code fetched afterwards
        condition: ConditionCode,
    },

    /// No source with this product name is registered.
    #[error("no source named {0:?}")]
    UnknownSource(String),

    /// A source with this product name is already open.
    #[error("source {0:?} is already open")]
    DuplicateSource(String),

    /// The session was already closed.
    #[error("session is closed")]
    Closed,

    /// The triplet was not executed or did not return.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A source operation failed.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Most recent error, kept queryable after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Return code of the failing call
    pub return_code: ReturnCode,
    /// Condition code fetched after it
    pub condition: ConditionCode,
    /// Extra explanation text, when the source provides one
    pub extra: Option<String>,
}

impl ErrorRecord {
    /// Record for a failure without extra text.
    pub fn new(return_code: ReturnCode, condition: ConditionCode) -> Self {
        Self { return_code, condition, extra: None }
    }

    /// Fixed diagnostic text for the condition code.
    pub fn description(&self) -> &'static str {
        self.condition.description()
    }
}
