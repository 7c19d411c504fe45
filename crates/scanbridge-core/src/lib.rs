//! Scanbridge acquisition engine
//!
//! Drives image and audio acquisition devices through a broker that exposes
//! a single entry point. Every operation is a triplet (data group,
//! data-argument type, message) plus a typed payload.
//!
//! # Architecture
//!
//! The engine never talks to a platform library directly. The host supplies
//! a [`DriverEntry`] and a [`MemoryBroker`] for the OS-global memory table;
//! everything above that is plain Rust. The same code runs against a real
//! broker binding and against the simulated driver in `scanbridge-harness`.
//!
//! Calls are synchronous and made on the host's thread. Sources push
//! events into a queue; the host drains it with [`Session::pump_events`],
//! which is where acquisitions actually run.
//!
//! # Components
//!
//! - [`session`]: Broker connection, source enumeration, event routing
//! - [`source`]: One open device: lifecycle, capabilities, transfers
//! - [`dispatch`]: Triplet execution, liveness, watchdog
//! - [`codec`]: Capability containers through broker memory
//! - [`memory`]: Memory tables and scoped buffers
//! - [`state`]: Per-source lifecycle state machine
//! - [`cache`]: Capability value cache
//! - [`notify`]: Upstream notifications and listener verdicts
//! - [`config`]: Host-supplied settings
//! - [`error`]: Error types

pub mod cache;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod events;
pub mod memory;
pub mod notify;
pub mod session;
pub mod source;
pub mod state;
pub mod triplet;

pub use cache::{CapabilityCache, GetKind};
pub use codec::{CapabilityCodec, ContainerProbe, DecodedContainer};
pub use config::{
    AcquisitionConfig, ClipboardDelegate, DeferredClosePolicy, FailAction, FileTransferConfig,
    RetryPolicy, SessionConfig, TransferMode,
};
pub use dispatch::{Dispatcher, Liveness};
pub use entry::{DriverEntry, Payload, PayloadKind, PlatformEvent};
pub use error::{
    CapabilityError, DispatchError, ErrorRecord, MemoryError, SessionError, SourceError,
};
pub use events::{DriverEvent, EventEnvelope, EventQueue, EventSender};
pub use memory::{LegacyMemory, MemoryBroker, MemoryKind, MemoryStats, NegotiatedMemory, ScopedBuffer};
pub use notify::{Listener, Notification, Notifier, Verdict};
pub use session::{EventDisposition, Session};
pub use source::{
    AcquiredUnit, CloseReason, ContainerPreference, DeferredClose, SavePrompt, Source, UnitData,
    UnitMetadata, UnitOutcome, UnitReport,
};
pub use state::{SourceState, StateMachine, StateMask, Transition};
pub use triplet::{Reply, Triplet};
