//! Session and source lifecycle against the simulated broker.

use std::time::Duration;

use scanbridge_core::{
    AcquisitionConfig, DispatchError, GetKind, MemoryKind, Payload, Session, SessionConfig,
    SessionError, SourceError, SourceState, Triplet,
};
use scanbridge_harness::{Fault, FaultRule, RecordingListener, SimDevice, SimDriver};
use scanbridge_proto::{
    CapabilityId, ConditionCode, DataArgType, DataGroup, Identity, ItemType, Msg, ReturnCode,
    payloads::Status,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open(driver: &std::sync::Arc<SimDriver>) -> Session {
    init_logging();
    driver.open_session(SessionConfig::default()).unwrap()
}

#[test]
fn refused_open_reports_the_broker_condition() {
    let driver = SimDriver::new([SimDevice::flatbed("Flatbed")]);
    driver.inject(FaultRule::once(
        DataArgType::PARENT,
        Msg::OPENDSM,
        Fault::Return(ReturnCode::Failure, ConditionCode::Bummer),
    ));

    let result = driver.open_session(SessionConfig::default());
    assert!(matches!(
        result,
        Err(SessionError::OpenFailed { return_code: ReturnCode::Failure, condition: ConditionCode::Bummer })
    ));
    assert!(!driver.is_open());
}

#[test]
fn enumeration_and_selection() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha"), SimDevice::feeder("Beta")]);
    let mut session = open(&driver);

    assert_eq!(session.sources().unwrap().len(), 2);
    assert_eq!(session.user_select().unwrap(), None);

    driver.set_user_selection(Some("Beta"));
    assert_eq!(session.user_select().unwrap().unwrap().product_name, "Beta");

    session.open_source("Beta", AcquisitionConfig::default()).unwrap();
    session.select("Beta").unwrap();
    assert_eq!(session.selected().unwrap().name(), "Beta");
    assert_eq!(session.select("Alpha"), Err(SessionError::UnknownSource("Alpha".into())));
}

#[test]
fn a_source_opens_once() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);

    session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    let again = session.open_source("Alpha", AcquisitionConfig::default());
    assert!(matches!(again, Err(SessionError::DuplicateSource(name)) if name == "Alpha"));
    assert_eq!(driver.count(DataArgType::IDENTITY, Msg::OPENDS), 1);
}

#[test]
fn missing_device_fails_to_open() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);

    let result = session.open_source("Gamma", AcquisitionConfig::default());
    assert!(matches!(result, Err(SessionError::Source(SourceError::Protocol { .. }))));
    assert_eq!(session.last_error().unwrap().condition, ConditionCode::NoDs);
    assert!(session.source("Gamma").is_none());
}

#[test]
fn close_source_unwinds_an_enabled_source() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);

    session.open_source("Alpha", AcquisitionConfig::default()).unwrap().enable().unwrap();
    assert!(driver.is_ui_enabled("Alpha"));

    session.close_source("Alpha").unwrap();
    assert!(!driver.is_ui_enabled("Alpha"));
    assert!(!driver.is_device_open("Alpha"));
    assert_eq!(session.close_source("Alpha"), Err(SessionError::UnknownSource("Alpha".into())));
}

#[test]
fn lifecycle_walks_the_state_machine() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    assert_eq!(source.state(), SourceState::Opened);

    source.enable().unwrap();
    assert_eq!(source.state(), SourceState::UIEnabled);
    assert!(matches!(source.enable(), Err(SourceError::InvalidState { .. })));

    source.disable().unwrap();
    assert_eq!(source.state(), SourceState::Opened);

    source.close().unwrap();
    assert_eq!(source.state(), SourceState::Closed);
    source.close().unwrap();
    assert_eq!(driver.count(DataArgType::IDENTITY, Msg::CLOSEDS), 1);
}

#[test]
fn closed_session_rejects_everything() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    let dispatcher = session.dispatcher();
    let app = session.app().clone();

    session.close().unwrap();
    session.close().unwrap();
    assert!(!session.is_open());
    assert_eq!(session.sources(), Err(SessionError::Closed));
    assert!(matches!(
        session.open_source("Alpha", AcquisitionConfig::default()),
        Err(SessionError::Closed)
    ));

    let status = Triplet::control(&app, None, DataArgType::STATUS, Msg::GET, Payload::Status(Status::default()));
    assert_eq!(
        dispatcher.execute(status).unwrap_err(),
        DispatchError::TripletNotExecuted { dat: DataArgType::STATUS, msg: Msg::GET }
    );
}

#[test]
fn mismatched_payload_never_reaches_the_driver() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let session = open(&driver);
    driver.clear_calls();

    let triplet = Triplet::new(
        session.app(),
        None,
        DataGroup::Control,
        DataArgType::STATUS,
        Msg::GET,
        Payload::Parent(0),
    );
    assert!(matches!(
        session.dispatcher().execute(triplet),
        Err(DispatchError::PayloadMismatch { dat: DataArgType::STATUS, .. })
    ));
    assert!(driver.calls().is_empty());
}

#[test]
fn driver_panic_is_contained() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    let listener = RecordingListener::new();
    session.register_listener(listener.clone());
    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    driver.inject(FaultRule::once(DataArgType::CAPABILITY, Msg::GETCURRENT, Fault::Panic));
    let errors_before = listener.count("Error");

    let result = source.get_value(CapabilityId::XFERCOUNT, GetKind::GetCurrent, ItemType::Int16);
    assert_eq!(
        result,
        Err(SourceError::Dispatch(DispatchError::DriverFault {
            dat: DataArgType::CAPABILITY,
            msg: Msg::GETCURRENT,
        }))
    );
    assert!(!source.is_poisoned());
    let record = source.last_error().unwrap();
    assert_eq!(record.return_code, ReturnCode::Failure);
    assert_eq!(record.condition, ConditionCode::Bummer);
    assert!(record.extra.as_deref().unwrap().contains("driver fault"));
    assert_eq!(listener.count("Error"), errors_before + 1);

    assert!(source.get_value(CapabilityId::XFERCOUNT, GetKind::GetCurrent, ItemType::Int16).is_ok());
}

#[test]
fn watchdog_poisons_a_hung_source() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let config = SessionConfig { watchdog_timeout: Some(Duration::from_millis(50)), ..SessionConfig::default() };
    init_logging();
    let mut session = driver.open_session(config).unwrap();
    let listener = RecordingListener::new();
    session.register_listener(listener.clone());
    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    driver.inject(FaultRule::once(
        DataArgType::CAPABILITY,
        Msg::GETCURRENT,
        Fault::Delay(Duration::from_millis(300)),
    ));
    let errors_before = listener.count("Error");

    let result = source.get_value(CapabilityId::XFERCOUNT, GetKind::GetCurrent, ItemType::Int16);
    assert!(matches!(result, Err(SourceError::Dispatch(DispatchError::Timeout { .. }))));
    assert!(source.is_poisoned());
    assert_eq!(source.status(), Err(SourceError::Poisoned));
    assert!(source.last_error().unwrap().extra.as_deref().unwrap().contains("timed out"));
    assert_eq!(listener.count("Error"), errors_before + 1);

    // Let the abandoned call finish before the session closes
    std::thread::sleep(Duration::from_millis(400));
}

#[test]
fn legacy_broker_keeps_os_memory() {
    let driver = SimDriver::legacy([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    assert!(!session.has_negotiated_memory());
    assert_eq!(driver.count(DataArgType::ENTRYPOINT, Msg::GET), 0);

    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    assert_eq!(source.memory_kind(), MemoryKind::Legacy);
    assert!(!source.uses_callback());
}

#[test]
fn application_without_v2_support_keeps_os_memory() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut app = Identity::application("Scanbridge", "Harness", "Old app");
    app.supported_groups.remove(scanbridge_proto::SupportedGroups::APP2);
    init_logging();
    let mut session = driver.open_session_as(app, SessionConfig::default()).unwrap();

    assert!(!session.has_negotiated_memory());
    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    assert_eq!(source.memory_kind(), MemoryKind::Legacy);
    assert!(!source.uses_callback());
}

#[test]
fn status_text_explains_the_last_condition() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    let source = session.open_source("Alpha", AcquisitionConfig::default()).unwrap();
    driver.inject(FaultRule::once(
        DataArgType::CAPABILITY,
        Msg::GETCURRENT,
        Fault::Return(ReturnCode::Failure, ConditionCode::BadValue),
    ));

    assert!(source.get_value(CapabilityId::XFERCOUNT, GetKind::GetCurrent, ItemType::Int16).is_err());
    let record = source.last_error().unwrap();
    assert_eq!(record.condition, ConditionCode::BadValue);
    assert_eq!(record.description(), ConditionCode::BadValue.description());
    assert_eq!(source.status().unwrap(), ConditionCode::Success);
}

#[test]
fn session_close_still_closes_a_source_that_fails_to_disable() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    let mut session = open(&driver);
    session.open_source("Alpha", AcquisitionConfig::default()).unwrap().enable().unwrap();
    driver.inject(FaultRule::once(
        DataArgType::USERINTERFACE,
        Msg::DISABLEDS,
        Fault::Return(ReturnCode::Failure, ConditionCode::Bummer),
    ));

    let result = session.close();
    assert!(matches!(
        result,
        Err(SessionError::Source(SourceError::Protocol { dat: DataArgType::USERINTERFACE, msg: Msg::DISABLEDS, .. }))
    ));
    assert_eq!(driver.count(DataArgType::IDENTITY, Msg::CLOSEDS), 1);
    assert_eq!(driver.count(DataArgType::PARENT, Msg::CLOSEDSM), 1);
    assert!(!driver.is_device_open("Alpha"));
    assert!(!driver.is_open());
    assert!(!session.is_open());
}

#[test]
fn dropping_the_session_releases_the_broker() {
    let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
    {
        let mut session = open(&driver);
        session.open_source("Alpha", AcquisitionConfig::default()).unwrap().enable().unwrap();
    }
    assert!(!driver.is_device_open("Alpha"));
    assert!(!driver.is_open());
}
