//! One open device.
//!
//! A [`Source`] owns everything the client knows about a single device:
//! the identity the broker assigned it, its lifecycle [`StateMachine`], the
//! capability cache, the memory table fixed when it opened, the
//! acquisition settings and the units transferred so far.
//!
//! # Lifecycle
//!
//! 1. **Open**: the broker assigns an id and reports whether the source
//!    speaks 2.x. That fixes the memory table for the rest of the source's
//!    life and, for 2.x sources, registers the event callback.
//! 2. **Negotiate**: capabilities are read and written while Opened.
//! 3. **Enable**: the transfer mechanism, layout and scaling are applied and
//!    the interface is enabled.
//! 4. **Acquire**: driven by events (see [`Source::handle_event`]).
//! 5. **Disable / Close**: closing unwinds whatever is still active.
//!
//! A call abandoned by the watchdog poisons the source: the broker is not
//! reentrant, so every later operation fails with
//! [`SourceError::Poisoned`].

use std::{fmt, sync::Arc};

use scanbridge_proto::{
    CapValue, CapabilityId, ConditionCode, Container, ContainerShape, DataArgType, Identity,
    ItemType, Msg, QuerySupport, ReturnCode, SupportedGroups,
    payloads::{
        CapabilityRecord, ImageInfo, ImageLayout, PendingXfers, Status, StatusText, UserInterface,
    },
};

use crate::{
    cache::{CapabilityCache, GetKind},
    codec::{CapabilityCodec, ContainerProbe, DecodedContainer},
    config::{AcquisitionConfig, SessionConfig},
    dispatch::Dispatcher,
    entry::{Payload, PayloadKind},
    error::{CapabilityError, DispatchError, ErrorRecord, SourceError},
    events::EventSender,
    memory::{MemoryBroker, MemoryKind},
    notify::{Notification, Notifier},
    state::{SourceState, StateMachine, Transition},
    triplet::{Reply, Triplet},
};

/// Unwrap the payload variant an argument type is registered for, or
/// return a payload mismatch from the enclosing function.
macro_rules! take_payload {
    ($payload:expr, $dat:expr, $variant:ident) => {
        match $payload {
            Payload::$variant(inner) => inner,
            other => {
                return Err(DispatchError::PayloadMismatch {
                    dat: $dat,
                    expected: Some(PayloadKind::$variant),
                    found: other.kind(),
                }
                .into());
            },
        }
    };
}

mod orchestrator;
mod transfer;

pub(crate) use orchestrator::EventClaim;
pub use orchestrator::{CloseReason, DeferredClose};
pub use transfer::{AcquiredUnit, SavePrompt, UnitData, UnitMetadata, UnitOutcome, UnitReport};

/// Session-owned collaborators every source shares.
#[derive(Debug, Clone)]
pub(crate) struct SessionLink {
    /// Application identity with the broker-assigned id
    pub(crate) app: Identity,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) notifier: Arc<Notifier>,
    /// OS-global table, used by legacy sources
    pub(crate) os_memory: Arc<dyn MemoryBroker>,
    /// Table obtained through entry-point negotiation, if any
    pub(crate) negotiated: Option<Arc<dyn MemoryBroker>>,
    pub(crate) events: EventSender,
    pub(crate) config: SessionConfig,
}

/// Container shape to use when writing a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContainerPreference {
    /// One value becomes a OneValue; several follow the shape the source
    /// reports for the capability
    #[default]
    Auto,
    /// Exactly one value
    OneValue,
    /// A list
    Array,
    /// A list whose first value is current and default
    Enumeration,
    /// Exactly four values: min, max, step, current
    Range,
}

/// A device opened through a session.
pub struct Source {
    link: SessionLink,
    identity: Identity,
    machine: StateMachine,
    cache: CapabilityCache,
    codec: CapabilityCodec,
    acquisition: AcquisitionConfig,
    /// Interface settings the source was enabled with, reused to disable it
    ui: UserInterface,
    deferred: DeferredClose,
    uses_callback: bool,
    last_error: Option<ErrorRecord>,
    units: Vec<AcquiredUnit>,
    poisoned: bool,
    save_prompt: Option<Box<dyn SavePrompt>>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.identity.product_name)
            .field("id", &self.identity.id)
            .field("state", &self.machine.state())
            .field("memory", &self.codec.memory().kind())
            .field("uses_callback", &self.uses_callback)
            .field("poisoned", &self.poisoned)
            .field("units", &self.units.len())
            .finish_non_exhaustive()
    }
}

impl Source {
    pub(crate) fn new(link: SessionLink, product_name: &str, acquisition: AcquisitionConfig) -> Self {
        let deferred = DeferredClose::new(&link.config.deferred_close, product_name);
        let codec = CapabilityCodec::new(Arc::clone(&link.os_memory));
        Self {
            identity: Identity::source(product_name),
            machine: StateMachine::new(),
            cache: CapabilityCache::new(),
            codec,
            acquisition,
            ui: UserInterface::default(),
            deferred,
            uses_callback: false,
            last_error: None,
            units: Vec::new(),
            poisoned: false,
            save_prompt: None,
            link,
        }
    }

    /// Identity as the broker reported it.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Product name.
    pub fn name(&self) -> &str {
        &self.identity.product_name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.machine.state()
    }

    /// Pending transfers last reported by the source.
    pub fn pending_images(&self) -> i16 {
        self.machine.pending_images()
    }

    /// Memory table chosen at open.
    pub fn memory_kind(&self) -> MemoryKind {
        self.codec.memory().kind()
    }

    /// Whether events arrive through the registered callback rather than
    /// the process-event path.
    pub fn uses_callback(&self) -> bool {
        self.uses_callback
    }

    /// Most recent failure.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    /// Whether a timed-out call left the source unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Capability knowledge gathered so far.
    pub fn cache(&self) -> &CapabilityCache {
        &self.cache
    }

    /// Acquisition settings.
    pub fn acquisition(&self) -> &AcquisitionConfig {
        &self.acquisition
    }

    /// Replace the acquisition settings. Only allowed before enabling.
    pub fn set_acquisition(&mut self, acquisition: AcquisitionConfig) -> Result<(), SourceError> {
        if self.state() > SourceState::Opened {
            return Err(self.invalid("change acquisition settings"));
        }
        self.acquisition = acquisition;
        Ok(())
    }

    /// Install the prompt used for prompted file transfers.
    pub fn set_save_prompt(&mut self, prompt: Box<dyn SavePrompt>) {
        self.save_prompt = Some(prompt);
    }

    /// Units transferred so far.
    pub fn units(&self) -> &[AcquiredUnit] {
        &self.units
    }

    /// Take the transferred units, leaving none behind.
    pub fn take_units(&mut self) -> Vec<AcquiredUnit> {
        std::mem::take(&mut self.units)
    }

    pub(crate) fn open(&mut self) -> Result<(), SourceError> {
        self.machine.check(Transition::Open)?;

        let triplet = Triplet::control(
            &self.link.app,
            None,
            DataArgType::IDENTITY,
            Msg::OPENDS,
            Payload::Identity(self.identity.clone()),
        );
        let reply = self.call(triplet)?;
        let code = reply.code;
        let identity = take_payload!(reply.payload, DataArgType::IDENTITY, Identity);

        if !self.machine.commit(Transition::Open, code) {
            let condition = self.broker_condition();
            self.record_error(ErrorRecord::new(code, condition));
            return Err(SourceError::Protocol {
                dat: DataArgType::IDENTITY,
                msg: Msg::OPENDS,
                return_code: code,
                condition,
            });
        }

        self.identity = identity;
        self.codec = CapabilityCodec::new(self.select_memory());
        self.cache.clear();
        tracing::info!(
            source = %self.identity.product_name,
            id = self.identity.id,
            memory = ?self.memory_kind(),
            "source opened"
        );

        if self.all_v2() {
            self.register_callback();
        }
        Ok(())
    }

    /// Source, application and broker all speak 2.x.
    fn all_v2(&self) -> bool {
        self.identity.supported_groups.contains(SupportedGroups::DS2)
            && self.link.app.supported_groups.contains(SupportedGroups::APP2 | SupportedGroups::DSM2)
    }

    fn select_memory(&self) -> Arc<dyn MemoryBroker> {
        match &self.link.negotiated {
            Some(negotiated) if self.all_v2() => Arc::clone(negotiated),
            _ => Arc::clone(&self.link.os_memory),
        }
    }

    fn register_callback(&mut self) {
        let payload = Payload::Callback(self.link.events.clone());
        match self.call(self.control(DataArgType::CALLBACK, Msg::REGISTER_CALLBACK, payload)) {
            Ok(reply) if reply.code.is_success() => self.uses_callback = true,
            Ok(reply) => {
                tracing::warn!(code = ?reply.code, "callback refused, using process-event path");
            },
            Err(error) => {
                tracing::warn!(%error, "callback registration failed, using process-event path");
            },
        }
    }

    /// Apply the acquisition settings and enable the interface.
    pub fn enable(&mut self) -> Result<(), SourceError> {
        self.machine.check(Transition::Enable)?;

        let ui_only = self.acquisition.ui_only;
        if !ui_only {
            self.apply_acquisition_settings()?;
        }

        let ui = UserInterface {
            show_ui: self.acquisition.show_ui || ui_only,
            modal_ui: self.acquisition.modal_ui,
            parent: self.link.config.parent_window,
        };
        let msg = if ui_only { Msg::ENABLEDSUIONLY } else { Msg::ENABLEDS };

        self.notify(Notification::UiOpening { source: self.name().to_owned() });
        let reply = self.call(self.control(DataArgType::USERINTERFACE, msg, Payload::UserInterface(ui)))?;
        if !self.machine.commit(Transition::Enable, reply.code) {
            return Err(self.fail(DataArgType::USERINTERFACE, msg, reply.code));
        }

        self.ui = ui;
        self.deferred.reset();
        self.cache.on_state_change(self.state());
        self.notify(Notification::UiOpened { source: self.name().to_owned() });
        if !ui_only {
            self.notify(Notification::AcquireStarted { source: self.name().to_owned() });
        }
        Ok(())
    }

    fn apply_acquisition_settings(&mut self) -> Result<(), SourceError> {
        let mode = self.acquisition.mode;
        let mechanism_cap =
            if mode.is_audio() { CapabilityId::ACAP_XFERMECH } else { CapabilityId::ICAP_XFERMECH };
        let mechanism = mode.mechanism_code(self.acquisition.clipboard);
        self.set_value(
            mechanism_cap,
            ItemType::UInt16,
            vec![CapValue::UInt16(mechanism)],
            ContainerPreference::OneValue,
        )?;

        if let Some(frame) = self.acquisition.layout {
            if let Err(error) = self.set_image_layout(ImageLayout { frame, ..ImageLayout::default() }) {
                tracing::warn!(source = %self.name(), %error, "image layout not applied");
            }
        }

        if let Some((x, y)) = self.acquisition.scaling {
            for (cap, factor) in [(CapabilityId::ICAP_XSCALING, x), (CapabilityId::ICAP_YSCALING, y)] {
                let values = vec![CapValue::Fix32(factor)];
                if let Err(error) =
                    self.set_value(cap, ItemType::Fix32, values, ContainerPreference::OneValue)
                {
                    tracing::warn!(source = %self.name(), ?cap, %error, "scaling not applied");
                }
            }
        }
        Ok(())
    }

    /// Disable the interface.
    pub fn disable(&mut self) -> Result<(), SourceError> {
        self.machine.check(Transition::Disable)?;

        self.notify(Notification::UiClosing { source: self.name().to_owned() });
        let payload = Payload::UserInterface(self.ui);
        let reply = self.call(self.control(DataArgType::USERINTERFACE, Msg::DISABLEDS, payload))?;
        if !self.machine.commit(Transition::Disable, reply.code) {
            return Err(self.fail(DataArgType::USERINTERFACE, Msg::DISABLEDS, reply.code));
        }

        self.deferred.reset();
        self.cache.on_state_change(self.state());
        self.notify(Notification::UiClosed { source: self.name().to_owned() });
        Ok(())
    }

    /// Close the source, first abandoning pending transfers and disabling
    /// the interface if needed. Closing a closed source does nothing.
    pub fn close(&mut self) -> Result<(), SourceError> {
        if matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            self.reset_transfers()?;
        }
        if self.state() == SourceState::UIEnabled {
            self.disable()?;
        }
        if self.state() == SourceState::Closed {
            return Ok(());
        }
        self.send_close()
    }

    /// Close the source while its session is being torn down.
    ///
    /// Unlike [`Self::close`], a failed unwind does not stop the close
    /// request from being sent, and the source always ends up Closed. The
    /// first failure is returned.
    pub(crate) fn force_close(&mut self) -> Result<(), SourceError> {
        if self.state() == SourceState::Closed {
            return Ok(());
        }

        let mut failures = Vec::new();
        if matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            failures.extend(self.reset_transfers().err());
        }
        if self.state() == SourceState::UIEnabled {
            failures.extend(self.disable().err());
        }
        for error in &failures {
            tracing::warn!(source = %self.name(), %error, "unwind during teardown failed");
        }

        failures.extend(self.send_close().err());
        if self.state() != SourceState::Closed {
            tracing::warn!(source = %self.name(), state = ?self.state(), "source dropped without a clean close");
            self.machine.reset();
            self.cache.clear();
            self.uses_callback = false;
        }
        failures.into_iter().next().map_or(Ok(()), Err)
    }

    fn send_close(&mut self) -> Result<(), SourceError> {
        let triplet = Triplet::control(
            &self.link.app,
            None,
            DataArgType::IDENTITY,
            Msg::CLOSEDS,
            Payload::Identity(self.identity.clone()),
        );
        let reply = self.call(triplet)?;
        if !reply.code.is_success() {
            return Err(self.fail(DataArgType::IDENTITY, Msg::CLOSEDS, reply.code));
        }
        if !self.machine.commit(Transition::Close, reply.code) {
            self.machine.reset();
        }

        self.cache.clear();
        self.uses_callback = false;
        tracing::info!(source = %self.name(), "source closed");
        Ok(())
    }

    /// Read a capability, answering from cache when a valid value is held.
    ///
    /// `item_type` may be [`ItemType::Unknown`] to decode with the type the
    /// source reports.
    pub fn get_value(
        &mut self,
        cap: CapabilityId,
        kind: GetKind,
        item_type: ItemType,
    ) -> Result<Container, SourceError> {
        if kind.is_cacheable() {
            if let Some(cached) = self.cache.get(cap, kind, self.state()) {
                return Ok(cached.clone());
            }
        }
        Ok(self.get_decoded(cap, kind, item_type)?.container)
    }

    /// Read a capability from the source, bypassing the cache. Range
    /// containers also carry the raw record.
    pub fn get_decoded(
        &mut self,
        cap: CapabilityId,
        kind: GetKind,
        item_type: ItemType,
    ) -> Result<DecodedContainer, SourceError> {
        let decoded = self.read_capability(cap, kind.msg(), item_type, true)?;
        if kind == GetKind::Reset {
            self.cache.invalidate_current();
        }
        self.cache.store(cap, kind, self.state(), decoded.container.clone());
        Ok(decoded)
    }

    /// Operations the source supports for a capability.
    pub fn query_support(&mut self, cap: CapabilityId) -> Result<QuerySupport, SourceError> {
        let decoded = self.read_capability(cap, Msg::QUERYSUPPORT, ItemType::Int32, true)?;
        let bits = decoded.container.current().and_then(CapValue::as_i64).unwrap_or(0);
        Ok(QuerySupport::from_bits_truncate(bits as u32))
    }

    /// Shape and item type of a capability, without decoding its values.
    pub fn probe(&mut self, cap: CapabilityId) -> Result<ContainerProbe, SourceError> {
        self.require_open("probe capability")?;
        let request = Payload::Capability(CapabilityRecord::request(cap));
        let reply = self.call(self.control(DataArgType::CAPABILITY, Msg::GET, request))?;
        let code = reply.code;
        let record = take_payload!(reply.payload, DataArgType::CAPABILITY, Capability);
        if !code.is_success() {
            self.codec.discard(&record);
            return Err(self.capability_failed(cap, code, false));
        }
        Ok(self.codec.probe(&record)?)
    }

    fn read_capability(
        &mut self,
        cap: CapabilityId,
        msg: Msg,
        item_type: ItemType,
        report: bool,
    ) -> Result<DecodedContainer, SourceError> {
        self.require_open("get capability")?;
        let request = Payload::Capability(CapabilityRecord::request(cap));
        let reply = self.call(self.control(DataArgType::CAPABILITY, msg, request))?;
        let code = reply.code;
        let record = take_payload!(reply.payload, DataArgType::CAPABILITY, Capability);
        if !code.is_success() {
            self.codec.discard(&record);
            return Err(self.capability_failed(cap, code, report));
        }

        self.codec.decode(&record, item_type).map_err(|error| {
            tracing::warn!(source = %self.identity.product_name, ?cap, %error, "capability decode failed");
            SourceError::from(error)
        })
    }

    fn capability_failed(&mut self, cap: CapabilityId, code: ReturnCode, report: bool) -> SourceError {
        let record = self.diagnose(code);
        let condition = record.condition;
        if matches!(condition, ConditionCode::CapUnsupported | ConditionCode::BadCap) {
            self.cache.mark_unsupported(cap);
        }
        if report {
            self.record_error(record);
        }
        CapabilityError::Protocol { cap, return_code: code, condition }.into()
    }

    /// Set a capability. Returns `CheckStatus` when the source substituted
    /// a value of its own.
    pub fn set_value(
        &mut self,
        cap: CapabilityId,
        item_type: ItemType,
        values: Vec<CapValue>,
        preference: ContainerPreference,
    ) -> Result<ReturnCode, SourceError> {
        self.write_capability(cap, Msg::SET, item_type, values, preference)
    }

    /// Restrict the values a capability may take.
    pub fn set_constraint(
        &mut self,
        cap: CapabilityId,
        item_type: ItemType,
        values: Vec<CapValue>,
        preference: ContainerPreference,
    ) -> Result<ReturnCode, SourceError> {
        self.write_capability(cap, Msg::SETCONSTRAINT, item_type, values, preference)
    }

    fn write_capability(
        &mut self,
        cap: CapabilityId,
        msg: Msg,
        item_type: ItemType,
        values: Vec<CapValue>,
        preference: ContainerPreference,
    ) -> Result<ReturnCode, SourceError> {
        self.require_open("set capability")?;
        let container = self.build_container(cap, item_type, values, preference)?;

        let buffer = self.codec.encode(&container)?;
        let record = CapabilityRecord::with_container(cap, container.shape(), buffer.handle());
        let reply = self.call(self.control(DataArgType::CAPABILITY, msg, Payload::Capability(record)))?;
        // The container is ours whatever the source answered
        buffer.release()?;

        self.cache.invalidate_current();
        if !reply.code.is_success() {
            return Err(self.capability_failed(cap, reply.code, true));
        }
        if reply.code == ReturnCode::CheckStatus {
            tracing::debug!(source = %self.name(), ?cap, "source substituted a value");
        }
        Ok(reply.code)
    }

    fn build_container(
        &mut self,
        cap: CapabilityId,
        item_type: ItemType,
        values: Vec<CapValue>,
        preference: ContainerPreference,
    ) -> Result<Container, SourceError> {
        let item_type = if item_type == ItemType::Unknown {
            cap.default_item_type().ok_or(CapabilityError::UnknownItemType {
                cap,
                item_type: ItemType::UNKNOWN_RAW,
            })?
        } else {
            item_type
        };

        let count = values.len();
        let shape = match preference {
            ContainerPreference::Auto if count == 1 => ContainerShape::OneValue,
            ContainerPreference::Auto => match self.probe(cap) {
                Ok(probe) if probe.shape == ContainerShape::Range && count == 4 => ContainerShape::Range,
                Ok(probe) if probe.shape == ContainerShape::Enumeration => ContainerShape::Enumeration,
                Ok(_) => ContainerShape::Array,
                Err(error @ (SourceError::Poisoned | SourceError::Dispatch(_))) => return Err(error),
                Err(error) => {
                    tracing::debug!(?cap, %error, "probe failed, sending an array");
                    ContainerShape::Array
                },
            },
            ContainerPreference::OneValue => ContainerShape::OneValue,
            ContainerPreference::Array => ContainerShape::Array,
            ContainerPreference::Enumeration => ContainerShape::Enumeration,
            ContainerPreference::Range => ContainerShape::Range,
        };

        let mismatch = || CapabilityError::ValueCount { cap, shape: shape.name(), count };
        let container = match shape {
            ContainerShape::OneValue => {
                let [value]: [CapValue; 1] = values.try_into().map_err(|_| mismatch())?;
                Container::one(item_type, value)
            },
            ContainerShape::Array | ContainerShape::Enumeration if count == 0 => {
                return Err(mismatch().into());
            },
            ContainerShape::Array => Container::Array { item_type, values },
            ContainerShape::Enumeration => Container::Enumeration {
                item_type,
                values,
                current_index: 0,
                default_index: 0,
            },
            ContainerShape::Range => {
                let [min, max, step, current]: [CapValue; 4] =
                    values.try_into().map_err(|_| mismatch())?;
                Container::Range { item_type, min, max, step, current, default: None }
            },
        };
        Ok(container)
    }

    /// Reset every capability to its power-on default. Only while Opened.
    pub fn reset_all(&mut self) -> Result<(), SourceError> {
        if self.state() != SourceState::Opened {
            return Err(self.invalid("reset all capabilities"));
        }
        let request = Payload::Capability(CapabilityRecord::request(CapabilityId::CAP_SUPPORTEDCAPS));
        let reply = self.call(self.control(DataArgType::CAPABILITY, Msg::RESETALL, request))?;
        let code = reply.code;
        let record = take_payload!(reply.payload, DataArgType::CAPABILITY, Capability);
        self.codec.discard(&record);

        self.cache.invalidate_all();
        if !code.is_success() {
            return Err(self.fail(DataArgType::CAPABILITY, Msg::RESETALL, code));
        }
        Ok(())
    }

    /// Capabilities the source lists as supported. Cached after the first
    /// successful read.
    pub fn supported_capabilities(&mut self) -> Result<Vec<CapabilityId>, SourceError> {
        if let Some(caps) = self.cache.supported() {
            return Ok(caps.iter().copied().collect());
        }
        let container = self.get_value(CapabilityId::CAP_SUPPORTEDCAPS, GetKind::Get, ItemType::UInt16)?;
        let caps: Vec<CapabilityId> = container
            .values()
            .into_iter()
            .filter_map(CapValue::as_i64)
            .filter_map(|raw| u16::try_from(raw).ok())
            .map(CapabilityId)
            .collect();
        self.cache.set_supported(caps.iter().copied());
        Ok(caps)
    }

    /// Whether the source supports a capability.
    ///
    /// Uses the supported list; sources that cannot produce one are asked
    /// for the capability's query-support flags instead.
    pub fn is_capability_supported(&mut self, cap: CapabilityId) -> Result<bool, SourceError> {
        if let Some(known) = self.cache.is_supported(cap) {
            return Ok(known);
        }
        match self.supported_capabilities() {
            Ok(caps) => Ok(caps.contains(&cap)),
            Err(SourceError::Capability(CapabilityError::Protocol { .. })) => {
                match self.read_capability(cap, Msg::QUERYSUPPORT, ItemType::Int32, false) {
                    Ok(decoded) => {
                        Ok(decoded.container.current().and_then(CapValue::as_i64).unwrap_or(0) != 0)
                    },
                    Err(SourceError::Capability(CapabilityError::Protocol { .. })) => Ok(false),
                    Err(error) => Err(error),
                }
            },
            Err(error) => Err(error),
        }
    }

    /// Request a number of transfers.
    ///
    /// Sources with a sheet count get the count there and an unbounded
    /// transfer count. Otherwise a duplex source is asked for two transfers
    /// per sheet. Returns the transfer count requested.
    pub fn set_transfer_count(&mut self, count: i16) -> Result<i16, SourceError> {
        if self.is_capability_supported(CapabilityId::CAP_SHEETCOUNT)? {
            let sheets = u32::try_from(count).unwrap_or(0);
            self.set_value(
                CapabilityId::CAP_SHEETCOUNT,
                ItemType::UInt32,
                vec![CapValue::UInt32(sheets)],
                ContainerPreference::OneValue,
            )?;
            self.set_value(
                CapabilityId::XFERCOUNT,
                ItemType::Int16,
                vec![CapValue::Int16(-1)],
                ContainerPreference::OneValue,
            )?;
            return Ok(-1);
        }

        let effective = if count > 0 && self.duplex_enabled()? { count.saturating_mul(2) } else { count };
        self.set_value(
            CapabilityId::XFERCOUNT,
            ItemType::Int16,
            vec![CapValue::Int16(effective)],
            ContainerPreference::OneValue,
        )?;
        Ok(effective)
    }

    fn duplex_enabled(&mut self) -> Result<bool, SourceError> {
        if !self.is_capability_supported(CapabilityId::CAP_DUPLEXENABLED)? {
            return Ok(false);
        }
        let container =
            self.get_value(CapabilityId::CAP_DUPLEXENABLED, GetKind::GetCurrent, ItemType::Bool)?;
        Ok(container.current().and_then(CapValue::as_bool).unwrap_or(false))
    }

    /// Condition code of the last operation.
    pub fn status(&mut self) -> Result<ConditionCode, SourceError> {
        self.require_open("query status")?;
        self.query_status()
    }

    /// Explanation of the last condition, for 2.x sources that provide one.
    pub fn status_text(&mut self) -> Result<Option<String>, SourceError> {
        self.require_open("query status")?;
        let condition = self.query_status()?;
        self.query_status_text(condition)
    }

    /// Metadata of the image about to be transferred.
    pub fn image_info(&mut self) -> Result<ImageInfo, SourceError> {
        if !matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            return Err(self.invalid("read image info"));
        }
        match self.fetch_image_info()? {
            Ok(info) => Ok(info),
            Err(record) => Err(self.report(DataArgType::IMAGEINFO, Msg::GET, record)),
        }
    }

    fn fetch_image_info(&mut self) -> Result<Result<ImageInfo, ErrorRecord>, SourceError> {
        let payload = Payload::ImageInfo(ImageInfo::default());
        match self.fetch(self.image(DataArgType::IMAGEINFO, Msg::GET, payload))? {
            Ok(payload) => Ok(Ok(take_payload!(payload, DataArgType::IMAGEINFO, ImageInfo))),
            Err(record) => Ok(Err(record)),
        }
    }

    /// Current acquisition area.
    pub fn image_layout(&mut self) -> Result<ImageLayout, SourceError> {
        self.require_open("read image layout")?;
        let payload = Payload::ImageLayout(ImageLayout::default());
        match self.fetch(self.image(DataArgType::IMAGELAYOUT, Msg::GET, payload))? {
            Ok(payload) => Ok(take_payload!(payload, DataArgType::IMAGELAYOUT, ImageLayout)),
            Err(record) => Err(self.report(DataArgType::IMAGELAYOUT, Msg::GET, record)),
        }
    }

    /// Set the acquisition area. Only while Opened.
    pub fn set_image_layout(&mut self, layout: ImageLayout) -> Result<ReturnCode, SourceError> {
        if self.state() != SourceState::Opened {
            return Err(self.invalid("set image layout"));
        }
        let payload = Payload::ImageLayout(layout);
        let reply = self.call(self.image(DataArgType::IMAGELAYOUT, Msg::SET, payload))?;
        if !reply.code.is_success() {
            return Err(self.fail(DataArgType::IMAGELAYOUT, Msg::SET, reply.code));
        }
        Ok(reply.code)
    }

    /// Conclude the current transfer. When nothing is pending the source
    /// returns to UIEnabled.
    pub fn end_transfer(&mut self) -> Result<PendingXfers, SourceError> {
        self.require_transfer("end transfer")?;
        let pending = self.pending_xfers(Msg::ENDXFER)?;
        if !pending.has_more() {
            self.finish_transfers();
        }
        Ok(pending)
    }

    /// Abandon every pending transfer and return to UIEnabled.
    pub fn reset_transfers(&mut self) -> Result<(), SourceError> {
        self.require_transfer("reset transfers")?;
        self.pending_xfers(Msg::RESET)?;
        self.machine.set_pending(0);
        self.finish_transfers();
        Ok(())
    }

    /// Ask the feeder to stop after the sheet in progress.
    pub fn stop_feeder(&mut self) -> Result<PendingXfers, SourceError> {
        self.require_transfer("stop feeder")?;
        self.pending_xfers(Msg::STOPFEEDER)
    }

    fn pending_xfers(&mut self, msg: Msg) -> Result<PendingXfers, SourceError> {
        let payload = Payload::PendingXfers(PendingXfers::default());
        let reply = self.call(self.control(DataArgType::PENDINGXFERS, msg, payload))?;
        let code = reply.code;
        let pending = take_payload!(reply.payload, DataArgType::PENDINGXFERS, PendingXfers);
        if !code.is_success() {
            return Err(self.fail(DataArgType::PENDINGXFERS, msg, code));
        }
        self.machine.set_pending(pending.count);
        Ok(pending)
    }

    fn finish_transfers(&mut self) {
        if self.machine.commit(Transition::EndTransfer, ReturnCode::Success) {
            self.cache.on_state_change(self.state());
        }
    }

    fn require_open(&self, operation: &str) -> Result<(), SourceError> {
        if self.state().is_open() { Ok(()) } else { Err(self.invalid(operation)) }
    }

    fn require_transfer(&self, operation: &str) -> Result<(), SourceError> {
        if matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            Ok(())
        } else {
            Err(self.invalid(operation))
        }
    }

    fn invalid(&self, operation: &str) -> SourceError {
        SourceError::InvalidState { state: self.state(), operation: operation.to_string() }
    }

    fn control(&self, dat: DataArgType, msg: Msg, payload: Payload) -> Triplet {
        Triplet::control(&self.link.app, Some(&self.identity), dat, msg, payload)
    }

    fn image(&self, dat: DataArgType, msg: Msg, payload: Payload) -> Triplet {
        Triplet::image(&self.link.app, &self.identity, dat, msg, payload)
    }

    fn audio(&self, dat: DataArgType, msg: Msg, payload: Payload) -> Triplet {
        Triplet::audio(&self.link.app, &self.identity, dat, msg, payload)
    }

    /// Execute a triplet against this source.
    fn call(&mut self, triplet: Triplet) -> Result<Reply, SourceError> {
        if self.poisoned {
            return Err(SourceError::Poisoned);
        }
        match self.link.dispatcher.execute(triplet) {
            Ok(reply) => Ok(reply),
            Err(error @ DispatchError::Timeout { .. }) => {
                tracing::warn!(source = %self.identity.product_name, %error, "source poisoned");
                self.poisoned = true;
                self.record_fault(&error);
                Err(error.into())
            },
            Err(error @ DispatchError::DriverFault { .. }) => {
                self.record_fault(&error);
                Err(error.into())
            },
            Err(error) => Err(error.into()),
        }
    }

    /// The source never answered, so there is no status to ask for.
    fn record_fault(&mut self, error: &DispatchError) {
        self.record_error(ErrorRecord {
            return_code: ReturnCode::Failure,
            condition: ConditionCode::Bummer,
            extra: Some(error.to_string()),
        });
    }

    /// Execute a single-shot call; a failure comes back diagnosed.
    fn fetch(&mut self, triplet: Triplet) -> Result<Result<Payload, ErrorRecord>, SourceError> {
        let reply = self.call(triplet)?;
        if reply.code.is_success() { Ok(Ok(reply.payload)) } else { Ok(Err(self.diagnose(reply.code))) }
    }

    fn query_status(&mut self) -> Result<ConditionCode, SourceError> {
        let payload = Payload::Status(Status::default());
        let reply = self.call(self.control(DataArgType::STATUS, Msg::GET, payload))?;
        let code = reply.code;
        let status = take_payload!(reply.payload, DataArgType::STATUS, Status);
        if !code.is_success() {
            return Err(SourceError::Protocol {
                dat: DataArgType::STATUS,
                msg: Msg::GET,
                return_code: code,
                condition: ConditionCode::Bummer,
            });
        }
        Ok(status.condition)
    }

    fn query_status_text(&mut self, condition: ConditionCode) -> Result<Option<String>, SourceError> {
        if !self.identity.speaks_v2() {
            return Ok(None);
        }
        let request = StatusText { status: Status { condition, data: 0 }, text: String::new() };
        let reply = self.call(self.control(DataArgType::STATUSUTF8, Msg::GET, Payload::StatusText(request)))?;
        let code = reply.code;
        let text = take_payload!(reply.payload, DataArgType::STATUSUTF8, StatusText);
        Ok((code.is_success() && !text.text.is_empty()).then_some(text.text))
    }

    /// Condition of the broker itself, for calls the source never saw.
    fn broker_condition(&mut self) -> ConditionCode {
        let triplet = Triplet::control(
            &self.link.app,
            None,
            DataArgType::STATUS,
            Msg::GET,
            Payload::Status(Status::default()),
        );
        match self.call(triplet) {
            Ok(Reply { code, payload: Payload::Status(status), .. }) if code.is_success() => {
                status.condition
            },
            _ => ConditionCode::Bummer,
        }
    }

    /// Fetch the condition code, and extra text where available, after a
    /// failed call.
    fn diagnose(&mut self, return_code: ReturnCode) -> ErrorRecord {
        let condition = self.query_status().unwrap_or_else(|error| {
            tracing::debug!(%error, "status query failed");
            ConditionCode::Bummer
        });
        let extra = self.query_status_text(condition).ok().flatten();
        ErrorRecord { return_code, condition, extra }
    }

    fn record_error(&mut self, error: ErrorRecord) {
        tracing::warn!(
            source = %self.identity.product_name,
            return_code = ?error.return_code,
            condition = %error.condition,
            "source operation failed"
        );
        self.last_error = Some(error.clone());
        self.notify(Notification::Error { source: Some(self.identity.product_name.clone()), error });
    }

    fn report(&mut self, dat: DataArgType, msg: Msg, record: ErrorRecord) -> SourceError {
        let (return_code, condition) = (record.return_code, record.condition);
        self.record_error(record);
        SourceError::Protocol { dat, msg, return_code, condition }
    }

    fn fail(&mut self, dat: DataArgType, msg: Msg, return_code: ReturnCode) -> SourceError {
        let record = self.diagnose(return_code);
        self.report(dat, msg, record)
    }

    fn notify(&self, notification: Notification) -> crate::notify::Verdict {
        self.link.notifier.notify(notification)
    }
}
