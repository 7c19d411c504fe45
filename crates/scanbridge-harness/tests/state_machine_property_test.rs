//! Model-based property tests for the source lifecycle.
//!
//! Random operation sequences run against a source on the simulated
//! broker and against a small reference model. After every step the
//! source, the simulated device and the model must agree.
//!
//! ```text
//! proptest generates: Vec<Op>
//!                        │
//!          ┌─────────────┼─────────────┐
//!          ▼             ▼             ▼
//!        Model     Source + SimDriver  Compare
//! ```

use std::sync::Arc;

use proptest::prelude::*;
use scanbridge_core::{
    AcquisitionConfig, GetKind, MemoryBroker, Session, SessionConfig, SourceError, SourceState,
};
use scanbridge_harness::{SimDevice, SimDriver, SimPage};
use scanbridge_proto::{CapabilityId, ItemType, Msg, payloads::ImageLayout};

const NAME: &str = "Model";

#[derive(Debug, Clone, Copy)]
enum Op {
    Enable,
    Disable,
    Acquire,
    ReadCapability,
    SetLayout,
    ResetAll,
    Close,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enable),
        2 => Just(Op::Disable),
        3 => Just(Op::Acquire),
        2 => Just(Op::ReadCapability),
        1 => Just(Op::SetLayout),
        1 => Just(Op::ResetAll),
        1 => Just(Op::Close),
    ]
}

/// Reference model: where the source should be and what it should hold.
#[derive(Debug)]
struct Model {
    state: SourceState,
    pages_left: usize,
    acquired: usize,
}

impl Model {
    /// Expected outcome of an operation: `true` when it should succeed.
    fn apply(&mut self, op: Op) -> bool {
        match (op, self.state) {
            (Op::Enable, SourceState::Opened) => {
                self.state = SourceState::UIEnabled;
                true
            },
            (Op::Disable, SourceState::UIEnabled) => {
                self.state = SourceState::Opened;
                true
            },
            (Op::Acquire, SourceState::UIEnabled) if self.pages_left > 0 => {
                self.acquired += self.pages_left;
                self.pages_left = 0;
                self.state = SourceState::Opened;
                true
            },
            (Op::Acquire, _) => true,
            (Op::ReadCapability, state) => state.is_open(),
            (Op::SetLayout | Op::ResetAll, SourceState::Opened) => true,
            (Op::Close, _) => {
                self.state = SourceState::Closed;
                true
            },
            _ => false,
        }
    }
}

fn run(driver: &SimDriver, session: &mut Session, op: Op) -> Result<(), SourceError> {
    if let Op::Acquire = op {
        if driver.raise(NAME, Msg::XFERREADY) {
            session.pump_events().unwrap();
        }
        return Ok(());
    }

    let source = session.source_mut(NAME).unwrap();
    match op {
        Op::Enable => source.enable(),
        Op::Disable => source.disable(),
        Op::ReadCapability => {
            source.get_value(CapabilityId::XFERCOUNT, GetKind::GetCurrent, ItemType::Int16).map(|_| ())
        },
        Op::SetLayout => source.set_image_layout(ImageLayout::default()).map(|_| ()),
        Op::ResetAll => source.reset_all(),
        Op::Close => source.close(),
        Op::Acquire => Ok(()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn source_agrees_with_the_model(
        ops in prop::collection::vec(op(), 1..40),
        page_count in 0usize..4,
    ) {
        let pages = (0..page_count).map(|seed| SimPage::seeded(seed as u64, 16, 4));
        let driver: Arc<SimDriver> = SimDriver::new([SimDevice::flatbed(NAME).with_pages(pages)]);
        let config = SessionConfig { log_triplets: false, ..SessionConfig::default() };
        let mut session = driver.open_session(config).unwrap();
        session.open_source(NAME, AcquisitionConfig::default()).unwrap();

        let mut model = Model { state: SourceState::Opened, pages_left: page_count, acquired: 0 };

        for op in ops {
            let expected = model.apply(op);
            let result = run(&driver, &mut session, op);

            prop_assert_eq!(result.is_ok(), expected, "{:?} returned {:?}", op, result);
            if let Err(error) = &result {
                let is_state_error = matches!(error, SourceError::InvalidState { .. });
                prop_assert!(is_state_error, "{:?} failed with {:?}", op, error);
            }

            let source = session.source(NAME).unwrap();
            prop_assert_eq!(source.state(), model.state);
            prop_assert_eq!(source.units().len(), model.acquired);
            prop_assert_eq!(driver.is_device_open(NAME), model.state.is_open());
            prop_assert_eq!(driver.is_ui_enabled(NAME), model.state == SourceState::UIEnabled);
        }

        prop_assert_eq!(driver.negotiated_memory().stats().live(), 0);
    }
}
