//! Simulated broker.
//!
//! [`SimDriver`] implements the single entry point over a set of
//! [`SimDevice`] scripts. It keeps a log of every call, accepts injected
//! faults (panics, delays, scripted failures) and lets a test raise device
//! events the way a real source would: through the registered callback for
//! 2.x sources, through the process-event path for the rest.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use scanbridge_core::{
    DriverEntry, LegacyMemory, MemoryBroker, NegotiatedMemory, Payload, Session, SessionConfig,
    SessionError,
};
use scanbridge_proto::{
    CapValue, CapabilityId, ConditionCode, DataArgType, DataGroup, Identity, Msg, ReturnCode,
    SupportedGroups, Version,
};

use crate::sim_device::{CapabilityWrite, DeviceRuntime, SimDevice};

/// Id the broker assigns the application.
const APP_ID: u32 = 1;

/// What an injected fault does to the call it matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The driver panics
    Panic,
    /// The call completes normally after a pause
    Delay(Duration),
    /// The call returns a code without reaching the device; the condition
    /// is reported by the next status query
    Return(ReturnCode, ConditionCode),
}

/// A fault bound to a (DAT, MSG) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultRule {
    /// Argument type to match
    pub dat: DataArgType,
    /// Message to match
    pub msg: Msg,
    /// What happens
    pub fault: Fault,
    /// Matches left, `None` for every match
    pub remaining: Option<u32>,
}

impl FaultRule {
    /// Fault the next matching call only.
    pub fn once(dat: DataArgType, msg: Msg, fault: Fault) -> Self {
        Self { dat, msg, fault, remaining: Some(1) }
    }

    /// Fault every matching call.
    pub fn always(dat: DataArgType, msg: Msg, fault: Fault) -> Self {
        Self { dat, msg, fault, remaining: None }
    }
}

/// One call as the broker saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRecord {
    /// Data group
    pub group: DataGroup,
    /// Argument type
    pub dat: DataArgType,
    /// Message
    pub msg: Msg,
    /// Destination source id, `None` for broker calls
    pub dest: Option<u32>,
    /// Return code produced
    pub code: ReturnCode,
}

#[derive(Debug)]
struct Broker {
    v2: bool,
    open: bool,
    condition: ConditionCode,
    devices: Vec<DeviceRuntime>,
    next_id: u32,
    enumeration: usize,
    user_selection: Option<String>,
    faults: Vec<FaultRule>,
    calls: Vec<CallRecord>,
}

impl Broker {
    fn fail(&mut self, condition: ConditionCode) -> ReturnCode {
        self.condition = condition;
        ReturnCode::Failure
    }

    fn device(&self, name: &str) -> Option<&DeviceRuntime> {
        self.devices.iter().find(|device| device.name() == name)
    }

    fn device_mut(&mut self, name: &str) -> Option<&mut DeviceRuntime> {
        self.devices.iter_mut().find(|device| device.name() == name)
    }

    fn take_fault(&mut self, dat: DataArgType, msg: Msg) -> Option<Fault> {
        let index = self.faults.iter().position(|rule| rule.dat == dat && rule.msg == msg)?;
        let rule = &mut self.faults[index];
        let fault = rule.fault.clone();
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.faults.remove(index);
            }
        }
        Some(fault)
    }

    fn identity_of(&self, device: &DeviceRuntime) -> Identity {
        let script = &device.script;
        let mut groups = SupportedGroups::CONTROL | SupportedGroups::IMAGE | SupportedGroups::AUDIO;
        if script.is_v2() {
            groups |= SupportedGroups::DS2;
        }
        Identity {
            id: device.id,
            version: Version { major: 1, minor: 0, language: 0, country: 0, info: "simulated".into() },
            protocol_major: if script.is_v2() { Identity::PROTOCOL_MAJOR } else { 1 },
            protocol_minor: if script.is_v2() { Identity::PROTOCOL_MINOR } else { 9 },
            supported_groups: groups,
            manufacturer: "Scanbridge".into(),
            product_family: "Simulated".into(),
            product_name: script.name().to_owned(),
        }
    }

    /// Calls addressed to the broker itself.
    fn broker_call(
        &mut self,
        origin: &mut Identity,
        dat: DataArgType,
        msg: Msg,
        payload: &mut Payload,
        memories: &Memories,
    ) -> ReturnCode {
        match (dat, msg) {
            (DataArgType::STATUS, Msg::GET) => {
                if let Payload::Status(status) = payload {
                    status.condition = std::mem::replace(&mut self.condition, ConditionCode::Success);
                }
                return ReturnCode::Success;
            },
            (DataArgType::PARENT, Msg::OPENDSM) => {
                if self.open {
                    return self.fail(ConditionCode::SeqError);
                }
                self.open = true;
                origin.id = APP_ID;
                if self.v2 && origin.supported_groups.contains(SupportedGroups::APP2) {
                    origin.supported_groups |= SupportedGroups::DSM2;
                }
                return ReturnCode::Success;
            },
            _ if !self.open => return self.fail(ConditionCode::SeqError),
            _ => {},
        }

        match (dat, msg, payload) {
            (DataArgType::PARENT, Msg::CLOSEDSM, _) => {
                if self.devices.iter().any(|device| device.open) {
                    return self.fail(ConditionCode::SeqError);
                }
                self.open = false;
                ReturnCode::Success
            },
            (DataArgType::ENTRYPOINT, Msg::GET, Payload::EntryPoint(slot)) => {
                if !self.v2 {
                    return self.fail(ConditionCode::BadProtocol);
                }
                *slot = Some(Arc::clone(&memories.negotiated));
                ReturnCode::Success
            },
            (DataArgType::IDENTITY, Msg::GETFIRST | Msg::GETNEXT, Payload::Identity(identity)) => {
                if msg == Msg::GETFIRST {
                    self.enumeration = 0;
                }
                let Some(device) = self.devices.get(self.enumeration) else {
                    return ReturnCode::EndOfList;
                };
                *identity = self.identity_of(device);
                self.enumeration += 1;
                ReturnCode::Success
            },
            (DataArgType::IDENTITY, Msg::GETDEFAULT, Payload::Identity(identity)) => {
                match self.devices.first() {
                    Some(device) => {
                        *identity = self.identity_of(device);
                        ReturnCode::Success
                    },
                    None => self.fail(ConditionCode::NoDs),
                }
            },
            (DataArgType::IDENTITY, Msg::USERSELECT, Payload::Identity(identity)) => {
                let chosen = self.user_selection.as_deref().and_then(|name| self.device(name));
                match chosen {
                    Some(device) => {
                        *identity = self.identity_of(device);
                        ReturnCode::Success
                    },
                    None => ReturnCode::Cancel,
                }
            },
            (DataArgType::IDENTITY, Msg::OPENDS, Payload::Identity(identity)) => {
                let Some(index) =
                    self.devices.iter().position(|device| device.name() == identity.product_name)
                else {
                    return self.fail(ConditionCode::NoDs);
                };
                if self.devices[index].open {
                    return self.fail(ConditionCode::SeqError);
                }

                let app_v2 = origin.supported_groups.contains(SupportedGroups::APP2);
                let memory: Arc<dyn MemoryBroker> =
                    if self.devices[index].script.is_v2() && app_v2 && self.v2 {
                        Arc::clone(&memories.negotiated)
                    } else {
                        Arc::clone(&memories.os)
                    };
                let device = &mut self.devices[index];
                device.id = self.next_id;
                device.open = true;
                device.memory = Some(memory);
                self.next_id += 1;
                *identity = self.identity_of(&self.devices[index]);
                ReturnCode::Success
            },
            (DataArgType::IDENTITY, Msg::CLOSEDS, Payload::Identity(identity)) => {
                let id = identity.id;
                match self.devices.iter_mut().find(|device| device.open && device.id == id) {
                    // A device closed with its interface up tears the interface down too
                    Some(device) => {
                        device.close();
                        ReturnCode::Success
                    },
                    None => self.fail(ConditionCode::BadDest),
                }
            },
            _ => self.fail(ConditionCode::BadProtocol),
        }
    }
}

#[derive(Debug)]
struct Memories {
    os: Arc<dyn MemoryBroker>,
    negotiated: Arc<dyn MemoryBroker>,
}

/// An in-process broker driving simulated devices.
#[derive(Debug)]
pub struct SimDriver {
    inner: Mutex<Broker>,
    memories: Memories,
    os_memory: Arc<LegacyMemory>,
    negotiated_memory: Arc<NegotiatedMemory>,
}

impl SimDriver {
    /// A 2.x broker offering the given devices.
    pub fn new(devices: impl IntoIterator<Item = SimDevice>) -> Arc<Self> {
        Arc::new(Self::build(devices, true))
    }

    /// A 1.x broker: no entry-point negotiation.
    pub fn legacy(devices: impl IntoIterator<Item = SimDevice>) -> Arc<Self> {
        Arc::new(Self::build(devices, false))
    }

    fn build(devices: impl IntoIterator<Item = SimDevice>, v2: bool) -> Self {
        let devices = devices.into_iter().map(|script| DeviceRuntime::new(script, 0)).collect();
        let os_memory = Arc::new(LegacyMemory::new());
        let negotiated_memory = Arc::new(NegotiatedMemory::new());
        let memories = Memories {
            os: Arc::clone(&os_memory) as Arc<dyn MemoryBroker>,
            negotiated: Arc::clone(&negotiated_memory) as Arc<dyn MemoryBroker>,
        };
        let broker = Broker {
            v2,
            open: false,
            condition: ConditionCode::Success,
            devices,
            next_id: APP_ID + 1,
            enumeration: 0,
            user_selection: None,
            faults: Vec::new(),
            calls: Vec::new(),
        };
        Self { inner: Mutex::new(broker), memories, os_memory, negotiated_memory }
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session as a 2.x application.
    pub fn open_session(self: &Arc<Self>, config: SessionConfig) -> Result<Session, SessionError> {
        self.open_session_as(Identity::application("Scanbridge", "Harness", "Harness"), config)
    }

    /// Open a session with a given application identity.
    pub fn open_session_as(
        self: &Arc<Self>,
        app: Identity,
        config: SessionConfig,
    ) -> Result<Session, SessionError> {
        let entry: Arc<dyn DriverEntry> = Arc::clone(self) as Arc<dyn DriverEntry>;
        Session::open(entry, Arc::clone(&self.memories.os), app, config)
    }

    /// OS-global memory table.
    pub fn os_memory(&self) -> &Arc<LegacyMemory> {
        &self.os_memory
    }

    /// Memory table handed out through negotiation.
    pub fn negotiated_memory(&self) -> &Arc<NegotiatedMemory> {
        &self.negotiated_memory
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.broker().calls.clone()
    }

    /// Number of calls with a given (DAT, MSG).
    pub fn count(&self, dat: DataArgType, msg: Msg) -> usize {
        self.broker().calls.iter().filter(|call| call.dat == dat && call.msg == msg).count()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.broker().calls.clear();
    }

    /// Capability writes a device received, in order.
    pub fn capability_writes(&self, device: &str) -> Vec<CapabilityWrite> {
        self.broker().device(device).map(|device| device.writes.clone()).unwrap_or_default()
    }

    /// Current value of a device capability.
    pub fn current_value(&self, device: &str, cap: CapabilityId) -> Option<CapValue> {
        let broker = self.broker();
        broker.device(device)?.capability(cap).map(|capability| capability.current().clone())
    }

    /// Completed unit transfers of a device.
    pub fn transfers(&self, device: &str) -> u32 {
        self.broker().device(device).map_or(0, |device| device.transfers)
    }

    /// Whether a device is open.
    pub fn is_device_open(&self, device: &str) -> bool {
        self.broker().device(device).is_some_and(|device| device.open)
    }

    /// Whether a device's interface is enabled.
    pub fn is_ui_enabled(&self, device: &str) -> bool {
        self.broker().device(device).is_some_and(|device| device.ui)
    }

    /// Whether the broker is open.
    pub fn is_open(&self) -> bool {
        self.broker().open
    }

    /// Name the user picks in the selection dialog, `None` to cancel.
    pub fn set_user_selection(&self, device: Option<&str>) {
        self.broker().user_selection = device.map(str::to_owned);
    }

    /// Add a fault rule. Earlier rules match first.
    pub fn inject(&self, rule: FaultRule) {
        self.broker().faults.push(rule);
    }

    /// Raise an event from a device. Returns false if the device is not
    /// open or the session is gone.
    ///
    /// [`Msg::XFERREADY`] only takes effect while the interface is enabled
    /// and pages remain.
    pub fn raise(&self, device: &str, msg: Msg) -> bool {
        let mut broker = self.broker();
        let Some(device) = broker.device_mut(device).filter(|device| device.open) else {
            return false;
        };
        if msg == Msg::XFERREADY && !device.arm() {
            return false;
        }
        match &device.callback {
            Some(callback) => callback.post(device.id, msg),
            None => {
                device.legacy_queue.push_back(msg);
                true
            },
        }
    }
}

impl DriverEntry for SimDriver {
    #[allow(clippy::panic)]
    fn call(
        &self,
        origin: &mut Identity,
        dest: Option<&Identity>,
        group: DataGroup,
        dat: DataArgType,
        msg: Msg,
        payload: &mut Payload,
    ) -> u16 {
        let fault = self.broker().take_fault(dat, msg);
        let dest_id = dest.map(|dest| dest.id);
        let mut guard = self.broker();
        let broker = &mut *guard;

        let scripted = match fault {
            Some(Fault::Panic) => {
                drop(guard);
                panic!("simulated driver fault on {dat:?}/{msg:?}")
            },
            Some(Fault::Delay(pause)) => {
                drop(guard);
                thread::sleep(pause);
                guard = self.broker();
                None
            },
            Some(Fault::Return(code, condition)) => {
                match dest_id.and_then(|id| broker.devices.iter_mut().find(|device| device.id == id)) {
                    Some(device) => device.set_condition(condition),
                    None => broker.condition = condition,
                }
                Some(code)
            },
            None => None,
        };

        let broker = &mut *guard;
        let code = match (scripted, dest_id) {
            (Some(code), _) => code,
            (None, None) => broker.broker_call(origin, dat, msg, payload, &self.memories),
            (None, Some(id)) => {
                match broker.devices.iter_mut().find(|device| device.open && device.id == id) {
                    Some(device) => device.handle(dat, msg, payload),
                    None => broker.fail(ConditionCode::BadDest),
                }
            },
        };

        broker.calls.push(CallRecord { group, dat, msg, dest: dest_id, code });
        code.to_u16()
    }
}

#[cfg(test)]
mod tests {
    use scanbridge_core::{MemoryKind, SourceState};

    use super::*;

    fn quiet() -> SessionConfig {
        SessionConfig { log_triplets: false, ..SessionConfig::default() }
    }

    #[test]
    fn enumeration_lists_every_device() {
        let driver = SimDriver::new([SimDevice::flatbed("Alpha"), SimDevice::flatbed("Beta")]);
        let mut session = driver.open_session(quiet()).unwrap();

        let names: Vec<String> =
            session.sources().unwrap().into_iter().map(|identity| identity.product_name).collect();
        assert_eq!(names, ["Alpha", "Beta"]);
        assert_eq!(session.default_source().unwrap().product_name, "Alpha");
    }

    #[test]
    fn v2_device_uses_negotiated_memory() {
        let driver = SimDriver::new([SimDevice::flatbed("Alpha"), SimDevice::flatbed("Old").legacy()]);
        let mut session = driver.open_session(quiet()).unwrap();
        assert!(session.has_negotiated_memory());

        let source = session.open_source("Alpha", Default::default()).unwrap();
        assert_eq!(source.memory_kind(), MemoryKind::Negotiated);
        assert!(source.uses_callback());

        let old = session.open_source("Old", Default::default()).unwrap();
        assert_eq!(old.memory_kind(), MemoryKind::Legacy);
        assert!(!old.uses_callback());
        assert_eq!(old.state(), SourceState::Opened);
    }

    #[test]
    fn fault_once_is_consumed() {
        let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
        driver.inject(FaultRule::once(
            DataArgType::IDENTITY,
            Msg::GETDEFAULT,
            Fault::Return(ReturnCode::Failure, ConditionCode::NoDs),
        ));
        let mut session = driver.open_session(quiet()).unwrap();

        assert!(session.default_source().is_err());
        assert_eq!(session.last_error().unwrap().condition, ConditionCode::NoDs);
        assert_eq!(session.default_source().unwrap().product_name, "Alpha");
    }

    #[test]
    fn closing_the_session_closes_the_broker() {
        let driver = SimDriver::new([SimDevice::flatbed("Alpha")]);
        let mut session = driver.open_session(quiet()).unwrap();
        session.open_source("Alpha", Default::default()).unwrap();
        assert!(driver.is_device_open("Alpha"));

        session.close().unwrap();
        assert!(!driver.is_device_open("Alpha"));
        assert!(!driver.is_open());
        assert_eq!(driver.count(DataArgType::PARENT, Msg::CLOSEDSM), 1);
    }
}
