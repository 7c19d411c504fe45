//! Deterministic simulation harness for scanbridge acquisition testing.
//!
//! An in-process broker ([`SimDriver`]) driving scripted devices
//! ([`SimDevice`]), so the full engine runs end to end without hardware:
//! enumeration, capability negotiation through real memory tables, every
//! transfer mechanism, event delivery over both the callback and the
//! process-event paths, and injected driver faults.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod recording;
pub mod sim_device;
pub mod sim_driver;

pub use recording::RecordingListener;
pub use sim_device::{CapabilityWrite, SimCapability, SimDevice, SimPage};
pub use sim_driver::{CallRecord, Fault, FaultRule, SimDriver};
