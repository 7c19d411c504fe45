//! Per-source state machine.
//!
//! # State Machine
//!
//! ```text
//!            open            enable             XferReady event
//! ┌────────┐ ─────> ┌────────┐ ─────> ┌───────────┐ ─────> ┌───────────┐
//! │ Closed │        │ Opened │        │ UIEnabled │        │ XferReady │
//! └────────┘ <───── └────────┘ <───── └───────────┘        └───────────┘
//!            close             disable        ^                  │ begin
//!                                             │ end              ↓
//!                                             │           ┌──────────────┐
//!                                             └────────── │ Transferring │
//!                                                         └──────────────┘
//! ```
//!
//! Callers check a transition with [`StateMachine::check`] before issuing
//! its triplet and apply it with [`StateMachine::commit`] afterwards. A
//! commit with a non-success return code leaves the state untouched.

use bitflags::bitflags;
use scanbridge_proto::ReturnCode;

use crate::error::SourceError;

/// Lifecycle state of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceState {
    /// Not open (initial, re-enterable)
    Closed,
    /// Open, capabilities negotiable
    Opened,
    /// Interface enabled, waiting for the device
    UIEnabled,
    /// Device signalled a transfer is ready
    XferReady,
    /// Transfers in progress
    Transferring,
}

bitflags! {
    /// Set of source states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateMask: u8 {
        /// [`SourceState::Closed`]
        const CLOSED = 0x01;
        /// [`SourceState::Opened`]
        const OPENED = 0x02;
        /// [`SourceState::UIEnabled`]
        const UI_ENABLED = 0x04;
        /// [`SourceState::XferReady`]
        const XFER_READY = 0x08;
        /// [`SourceState::Transferring`]
        const TRANSFERRING = 0x10;
    }
}

impl SourceState {
    /// Single-state mask.
    pub fn mask(self) -> StateMask {
        match self {
            Self::Closed => StateMask::CLOSED,
            Self::Opened => StateMask::OPENED,
            Self::UIEnabled => StateMask::UI_ENABLED,
            Self::XferReady => StateMask::XFER_READY,
            Self::Transferring => StateMask::TRANSFERRING,
        }
    }

    /// Open in any form.
    pub fn is_open(self) -> bool {
        self != Self::Closed
    }
}

/// Transition requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Closed → Opened
    Open,
    /// Opened → UIEnabled
    Enable,
    /// UIEnabled → XferReady
    XferReady,
    /// XferReady → Transferring
    BeginTransfer,
    /// Transferring (or XferReady) → UIEnabled
    EndTransfer,
    /// UIEnabled → Opened
    Disable,
    /// Opened → Closed
    Close,
}

impl Transition {
    /// Source and target state.
    pub fn edge(self) -> (StateMask, SourceState) {
        match self {
            Self::Open => (StateMask::CLOSED, SourceState::Opened),
            Self::Enable => (StateMask::OPENED, SourceState::UIEnabled),
            Self::XferReady => (StateMask::UI_ENABLED, SourceState::XferReady),
            Self::BeginTransfer => (StateMask::XFER_READY, SourceState::Transferring),
            Self::EndTransfer => {
                (StateMask::XFER_READY | StateMask::TRANSFERRING, SourceState::UIEnabled)
            },
            Self::Disable => (StateMask::UI_ENABLED, SourceState::Opened),
            Self::Close => (StateMask::OPENED, SourceState::Closed),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Enable => "enable",
            Self::XferReady => "accept xfer-ready",
            Self::BeginTransfer => "begin transfer",
            Self::EndTransfer => "end transfer",
            Self::Disable => "disable",
            Self::Close => "close",
        }
    }
}

/// State and transfer counters of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: SourceState,
    pending_images: i16,
    retries: u32,
}

impl StateMachine {
    /// Machine in the Closed state.
    pub fn new() -> Self {
        Self { state: SourceState::Closed, pending_images: 0, retries: 0 }
    }

    /// Current state.
    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Pending images last reported by the source (`-1` when unknown).
    pub fn pending_images(&self) -> i16 {
        self.pending_images
    }

    /// Retries spent on the current unit.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Verify a transition is allowed from the current state.
    pub fn check(&self, transition: Transition) -> Result<(), SourceError> {
        let (from, _) = transition.edge();
        if from.contains(self.state.mask()) {
            Ok(())
        } else {
            Err(SourceError::InvalidState {
                state: self.state,
                operation: transition.name().to_string(),
            })
        }
    }

    /// Apply a transition whose triplet returned `code`.
    ///
    /// Returns whether the state changed. Nothing changes unless the
    /// transition is allowed and `code` reports success.
    pub fn commit(&mut self, transition: Transition, code: ReturnCode) -> bool {
        if !code.is_success() || self.check(transition).is_err() {
            return false;
        }
        let (_, to) = transition.edge();
        tracing::debug!(from = ?self.state, ?to, "source state transition");
        self.state = to;
        match transition {
            Transition::BeginTransfer => self.retries = 0,
            Transition::EndTransfer | Transition::Disable | Transition::Close => {
                self.pending_images = 0;
                self.retries = 0;
            },
            _ => {},
        }
        true
    }

    /// Record the pending count reported by an end-transfer or reset.
    pub fn set_pending(&mut self, count: i16) {
        self.pending_images = count;
    }

    /// Count one retry of the current unit. Returns the new total.
    pub fn record_retry(&mut self) -> u32 {
        self.retries += 1;
        self.retries
    }

    /// A unit completed; the next one starts with a fresh retry budget.
    pub fn unit_completed(&mut self) {
        self.retries = 0;
    }

    /// Force the machine back to Closed after an unrecoverable failure.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OK: ReturnCode = ReturnCode::Success;

    fn at(state: SourceState) -> StateMachine {
        StateMachine { state, pending_images: 0, retries: 0 }
    }

    #[test]
    fn full_lifecycle() {
        let mut machine = StateMachine::new();
        for (transition, expected) in [
            (Transition::Open, SourceState::Opened),
            (Transition::Enable, SourceState::UIEnabled),
            (Transition::XferReady, SourceState::XferReady),
            (Transition::BeginTransfer, SourceState::Transferring),
            (Transition::EndTransfer, SourceState::UIEnabled),
            (Transition::Disable, SourceState::Opened),
            (Transition::Close, SourceState::Closed),
        ] {
            assert!(machine.commit(transition, OK));
            assert_eq!(machine.state(), expected);
        }
    }

    #[test]
    fn failure_never_changes_state() {
        let mut machine = at(SourceState::Opened);
        assert!(!machine.commit(Transition::Enable, ReturnCode::Failure));
        assert!(!machine.commit(Transition::Enable, ReturnCode::Cancel));
        assert_eq!(machine.state(), SourceState::Opened);

        assert!(machine.commit(Transition::Enable, ReturnCode::CheckStatus));
        assert_eq!(machine.state(), SourceState::UIEnabled);
    }

    #[test]
    fn transferring_only_via_xfer_ready() {
        let mut machine = at(SourceState::UIEnabled);
        assert!(matches!(
            machine.check(Transition::BeginTransfer),
            Err(SourceError::InvalidState { state: SourceState::UIEnabled, .. })
        ));
        assert!(!machine.commit(Transition::BeginTransfer, OK));

        assert!(machine.commit(Transition::XferReady, OK));
        assert!(machine.commit(Transition::BeginTransfer, OK));
        assert_eq!(machine.state(), SourceState::Transferring);
    }

    #[test]
    fn entering_transfer_resets_retries() {
        let mut machine = at(SourceState::XferReady);
        machine.record_retry();
        machine.record_retry();
        assert_eq!(machine.retries(), 2);

        machine.commit(Transition::BeginTransfer, OK);
        assert_eq!(machine.retries(), 0);
    }

    #[test]
    fn invalid_state_names_the_operation() {
        let machine = StateMachine::new();
        let err = machine.check(Transition::Disable).unwrap_err();
        assert_eq!(err.to_string(), "cannot disable in state Closed");
    }
}
