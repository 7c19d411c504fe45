//! Simulated devices.
//!
//! A [`SimDevice`] is a script: the capabilities it exposes and the pages it
//! will deliver, with per-page failures. The broker turns each script into a
//! [`DeviceRuntime`] when the device is opened and drives it from triplets.

use std::{
    collections::{BTreeMap, VecDeque},
    fs,
    sync::Arc,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use scanbridge_core::{EventSender, MemoryBroker, Payload, PlatformEvent};
use scanbridge_proto::{
    CapValue, CapabilityId, ConditionCode, Container, ContainerShape, DataArgType, ItemType,
    MemHandle, Msg, QuerySupport, ReturnCode,
    payloads::{
        AudioInfo, CapabilityRecord, DeviceEvent, ImageInfo, ImageLayout, ImageMemXfer,
        PendingXfers, SetupFileXfer, SetupMemXfer,
    },
};

/// One page (or audio clip) a device will deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPage {
    /// Bytes delivered by every mechanism
    pub data: Vec<u8>,
    /// Metadata reported before the transfer
    pub info: ImageInfo,
    /// The metadata query fails for this page
    pub info_fails: bool,
    /// Transfer attempts that fail before one succeeds
    pub transfer_failures: u32,
    /// The transfer is cancelled by the device
    pub cancel: bool,
}

impl SimPage {
    /// Page carrying exactly `data`, described as 8-bit gray, one row.
    pub fn new(data: Vec<u8>) -> Self {
        let info = ImageInfo {
            image_width: i32::try_from(data.len()).unwrap_or(i32::MAX),
            image_length: 1,
            samples_per_pixel: 1,
            bits_per_pixel: 8,
            ..ImageInfo::default()
        };
        Self { data, info, info_fails: false, transfer_failures: 0, cancel: false }
    }

    /// 8-bit gray page of the given size with content derived from `seed`.
    pub fn seeded(seed: u64, width: u16, length: u16) -> Self {
        let mut data = vec![0; usize::from(width) * usize::from(length)];
        ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut data);

        let info = ImageInfo {
            x_resolution: 300.0,
            y_resolution: 300.0,
            image_width: i32::from(width),
            image_length: i32::from(length),
            samples_per_pixel: 1,
            bits_per_pixel: 8,
            ..ImageInfo::default()
        };
        Self { data, info, info_fails: false, transfer_failures: 0, cancel: false }
    }

    /// The metadata query for this page fails.
    pub fn with_info_failure(mut self) -> Self {
        self.info_fails = true;
        self
    }

    /// The first `times` transfer attempts fail.
    pub fn failing(mut self, times: u32) -> Self {
        self.transfer_failures = times;
        self
    }

    /// The device cancels the transfer.
    pub fn cancelled(mut self) -> Self {
        self.cancel = true;
        self
    }
}

/// One capability a device exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct SimCapability {
    item_type: ItemType,
    /// Answer to a plain Get; its current value tracks `current`
    allowed: Container,
    current: CapValue,
    default: CapValue,
    support: QuerySupport,
    read_only: bool,
}

impl SimCapability {
    fn new(allowed: Container, current: CapValue) -> Self {
        Self {
            item_type: allowed.item_type(),
            default: current.clone(),
            current,
            allowed,
            support: QuerySupport::GET
                | QuerySupport::SET
                | QuerySupport::GET_CURRENT
                | QuerySupport::GET_DEFAULT
                | QuerySupport::RESET,
            read_only: false,
        }
    }

    /// Single-valued capability.
    pub fn one(item_type: ItemType, value: CapValue) -> Self {
        Self::new(Container::one(item_type, value.clone()), value)
    }

    /// Capability choosing among `values`.
    pub fn enumeration(item_type: ItemType, values: Vec<CapValue>, current_index: usize) -> Self {
        let current = values.get(current_index).cloned().unwrap_or(CapValue::UInt16(0));
        let allowed = Container::Enumeration {
            item_type,
            values,
            current_index: current_index as u32,
            default_index: current_index as u32,
        };
        Self::new(allowed, current)
    }

    /// Capability ranging from `min` to `max`.
    pub fn range(item_type: ItemType, min: CapValue, max: CapValue, step: CapValue, current: CapValue) -> Self {
        let allowed = Container::Range {
            item_type,
            min,
            max,
            step,
            current: current.clone(),
            default: Some(current.clone()),
        };
        Self::new(allowed, current)
    }

    /// List-valued capability.
    pub fn array(item_type: ItemType, values: Vec<CapValue>) -> Self {
        let current = values.first().cloned().unwrap_or(CapValue::UInt16(0));
        Self::new(Container::Array { item_type, values }, current)
    }

    /// Sets are rejected.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self.support.remove(QuerySupport::SET | QuerySupport::SET_CONSTRAINT | QuerySupport::RESET);
        self
    }

    /// Current value.
    pub fn current(&self) -> &CapValue {
        &self.current
    }

    fn answer(&self, msg: Msg) -> Container {
        match msg {
            Msg::GETCURRENT | Msg::RESET => Container::one(self.item_type, self.current.clone()),
            Msg::GETDEFAULT => Container::one(self.item_type, self.default.clone()),
            _ => match &self.allowed {
                Container::OneValue { .. } => Container::one(self.item_type, self.current.clone()),
                Container::Enumeration { values, default_index, .. } => Container::Enumeration {
                    item_type: self.item_type,
                    values: values.clone(),
                    current_index: values
                        .iter()
                        .position(|value| *value == self.current)
                        .unwrap_or(0) as u32,
                    default_index: *default_index,
                },
                Container::Range { min, max, step, .. } => Container::Range {
                    item_type: self.item_type,
                    min: min.clone(),
                    max: max.clone(),
                    step: step.clone(),
                    current: self.current.clone(),
                    default: Some(self.default.clone()),
                },
                array @ Container::Array { .. } => array.clone(),
            },
        }
    }

    fn accepts(&self, value: &CapValue) -> bool {
        match &self.allowed {
            Container::OneValue { .. } => true,
            Container::Array { values, .. } | Container::Enumeration { values, .. } => {
                values.contains(value)
            },
            Container::Range { min, max, .. } => {
                match (value.as_f64(), min.as_f64(), max.as_f64()) {
                    (Some(value), Some(min), Some(max)) => (min..=max).contains(&value),
                    _ => false,
                }
            },
        }
    }
}

/// A scripted device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    name: String,
    v2: bool,
    caps: BTreeMap<CapabilityId, SimCapability>,
    pages: Vec<SimPage>,
    lists_supported_caps: bool,
    unknown_count: bool,
    preferred_strip: u32,
    device_events: VecDeque<DeviceEvent>,
}

impl SimDevice {
    /// A 2.x flatbed with the capabilities every acquisition touches.
    pub fn flatbed(name: impl Into<String>) -> Self {
        let mut caps = BTreeMap::new();
        let u16s = |values: &[u16]| values.iter().copied().map(CapValue::UInt16).collect::<Vec<_>>();

        caps.insert(CapabilityId::XFERCOUNT, SimCapability::one(ItemType::Int16, CapValue::Int16(-1)));
        caps.insert(
            CapabilityId::ICAP_XFERMECH,
            SimCapability::enumeration(ItemType::UInt16, u16s(&[0, 1, 2]), 0),
        );
        caps.insert(
            CapabilityId::ACAP_XFERMECH,
            SimCapability::enumeration(ItemType::UInt16, u16s(&[0, 1]), 0),
        );
        caps.insert(
            CapabilityId::ICAP_PIXELTYPE,
            SimCapability::enumeration(ItemType::UInt16, u16s(&[0, 1, 2]), 1),
        );
        caps.insert(
            CapabilityId::ICAP_BITDEPTH,
            SimCapability::enumeration(ItemType::UInt16, u16s(&[1, 8, 24]), 1),
        );
        caps.insert(
            CapabilityId::ICAP_XRESOLUTION,
            SimCapability::range(
                ItemType::Fix32,
                CapValue::Fix32(50.0),
                CapValue::Fix32(1200.0),
                CapValue::Fix32(1.0),
                CapValue::Fix32(300.0),
            ),
        );
        caps.insert(
            CapabilityId::ICAP_YRESOLUTION,
            SimCapability::range(
                ItemType::Fix32,
                CapValue::Fix32(50.0),
                CapValue::Fix32(1200.0),
                CapValue::Fix32(1.0),
                CapValue::Fix32(300.0),
            ),
        );
        caps.insert(CapabilityId::ICAP_XSCALING, SimCapability::one(ItemType::Fix32, CapValue::Fix32(1.0)));
        caps.insert(CapabilityId::ICAP_YSCALING, SimCapability::one(ItemType::Fix32, CapValue::Fix32(1.0)));
        caps.insert(
            CapabilityId::CAP_DEVICEONLINE,
            SimCapability::one(ItemType::Bool, CapValue::Bool(true)).read_only(),
        );

        Self {
            name: name.into(),
            v2: true,
            caps,
            pages: Vec::new(),
            lists_supported_caps: true,
            unknown_count: false,
            preferred_strip: 0,
            device_events: VecDeque::new(),
        }
    }

    /// A feeder scanner: a flatbed plus sheet count.
    pub fn feeder(name: impl Into<String>) -> Self {
        Self::flatbed(name)
            .with_capability(CapabilityId::CAP_FEEDERENABLED, SimCapability::one(ItemType::Bool, CapValue::Bool(true)))
            .with_capability(CapabilityId::CAP_SHEETCOUNT, SimCapability::one(ItemType::UInt32, CapValue::UInt32(0)))
    }

    /// A duplex scanner without sheet count, duplex enabled.
    pub fn duplex(name: impl Into<String>) -> Self {
        Self::flatbed(name)
            .with_capability(CapabilityId::CAP_DUPLEX, SimCapability::one(ItemType::UInt16, CapValue::UInt16(1)).read_only())
            .with_capability(CapabilityId::CAP_DUPLEXENABLED, SimCapability::one(ItemType::Bool, CapValue::Bool(true)))
    }

    /// Speaks only the 1.x protocol: no callback, OS memory.
    pub fn legacy(mut self) -> Self {
        self.v2 = false;
        self
    }

    /// Add or replace a capability.
    pub fn with_capability(mut self, cap: CapabilityId, capability: SimCapability) -> Self {
        self.caps.insert(cap, capability);
        self
    }

    /// Remove a capability.
    pub fn without_capability(mut self, cap: CapabilityId) -> Self {
        self.caps.remove(&cap);
        self
    }

    /// Pages to deliver, in order.
    pub fn with_pages(mut self, pages: impl IntoIterator<Item = SimPage>) -> Self {
        self.pages.extend(pages);
        self
    }

    /// Report -1 pending while pages remain.
    pub fn with_unknown_count(mut self) -> Self {
        self.unknown_count = true;
        self
    }

    /// Answer the supported-capabilities query with a failure.
    pub fn without_supported_caps_list(mut self) -> Self {
        self.lists_supported_caps = false;
        self
    }

    /// Preferred strip size for buffered transfers, 0 for none.
    pub fn with_preferred_strip(mut self, size: u32) -> Self {
        self.preferred_strip = size;
        self
    }

    /// Queue a device event for the device-event query.
    pub fn with_device_event(mut self, event: DeviceEvent) -> Self {
        self.device_events.push_back(event);
        self
    }

    /// Product name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the device speaks 2.x.
    pub fn is_v2(&self) -> bool {
        self.v2
    }
}

/// A capability write as the device received it.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityWrite {
    /// Capability written
    pub cap: CapabilityId,
    /// Set or SetConstraint
    pub msg: Msg,
    /// Container as decoded by the device
    pub container: Container,
}

/// A device while open.
#[derive(Debug)]
pub(crate) struct DeviceRuntime {
    pub(crate) script: SimDevice,
    pub(crate) id: u32,
    pub(crate) open: bool,
    pub(crate) ui: bool,
    pub(crate) xfer_ready: bool,
    pub(crate) memory: Option<Arc<dyn MemoryBroker>>,
    pub(crate) callback: Option<EventSender>,
    pub(crate) legacy_queue: VecDeque<Msg>,
    pub(crate) writes: Vec<CapabilityWrite>,
    pub(crate) transfers: u32,
    pub(crate) layout: ImageLayout,
    condition: ConditionCode,
    cursor: usize,
    attempts: u32,
    strip_offset: usize,
    file: SetupFileXfer,
}

impl DeviceRuntime {
    pub(crate) fn new(script: SimDevice, id: u32) -> Self {
        Self {
            script,
            id,
            open: false,
            ui: false,
            xfer_ready: false,
            memory: None,
            callback: None,
            legacy_queue: VecDeque::new(),
            writes: Vec::new(),
            transfers: 0,
            layout: ImageLayout::default(),
            condition: ConditionCode::Success,
            cursor: 0,
            attempts: 0,
            strip_offset: 0,
            file: SetupFileXfer::default(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.script.name
    }

    pub(crate) fn close(&mut self) {
        self.open = false;
        self.ui = false;
        self.xfer_ready = false;
        self.memory = None;
        self.callback = None;
        self.legacy_queue.clear();
    }

    pub(crate) fn capability(&self, cap: CapabilityId) -> Option<&SimCapability> {
        self.script.caps.get(&cap)
    }

    pub(crate) fn set_condition(&mut self, condition: ConditionCode) {
        self.condition = condition;
    }

    /// Mark transfer readiness if pages remain.
    pub(crate) fn arm(&mut self) -> bool {
        self.xfer_ready = self.ui && self.cursor < self.script.pages.len();
        self.xfer_ready
    }

    fn fail(&mut self, condition: ConditionCode) -> ReturnCode {
        self.condition = condition;
        ReturnCode::Failure
    }

    fn pending(&self) -> i16 {
        let remaining = self.script.pages.len().saturating_sub(self.cursor);
        if self.script.unknown_count && remaining > 0 {
            -1
        } else {
            i16::try_from(remaining).unwrap_or(i16::MAX)
        }
    }

    fn current_page(&self) -> Option<&SimPage> {
        self.script.pages.get(self.cursor)
    }

    /// Execute one triplet addressed to this device.
    pub(crate) fn handle(&mut self, dat: DataArgType, msg: Msg, payload: &mut Payload) -> ReturnCode {
        match (dat, msg, payload) {
            (DataArgType::STATUS, Msg::GET, Payload::Status(status)) => {
                status.condition = std::mem::replace(&mut self.condition, ConditionCode::Success);
                ReturnCode::Success
            },
            (DataArgType::STATUSUTF8, Msg::GET, Payload::StatusText(text)) => {
                text.text = text.status.condition.description().to_string();
                ReturnCode::Success
            },
            (DataArgType::CALLBACK, Msg::REGISTER_CALLBACK, Payload::Callback(sender)) => {
                if !self.script.v2 {
                    return self.fail(ConditionCode::BadProtocol);
                }
                self.callback = Some(sender.clone());
                ReturnCode::Success
            },
            (DataArgType::CAPABILITY, msg, Payload::Capability(record)) => self.capability_call(msg, record),
            (DataArgType::USERINTERFACE, Msg::ENABLEDS | Msg::ENABLEDSUIONLY, Payload::UserInterface(_)) => {
                if self.ui {
                    return self.fail(ConditionCode::SeqError);
                }
                self.ui = true;
                ReturnCode::Success
            },
            (DataArgType::USERINTERFACE, Msg::DISABLEDS, Payload::UserInterface(_)) => {
                if !self.ui || self.xfer_ready {
                    return self.fail(ConditionCode::SeqError);
                }
                self.ui = false;
                ReturnCode::Success
            },
            (DataArgType::PENDINGXFERS, msg, Payload::PendingXfers(pending)) => self.pending_call(msg, pending),
            (DataArgType::IMAGEINFO, Msg::GET, Payload::ImageInfo(info)) => {
                let Some(page) = self.current_page().filter(|_| self.xfer_ready) else {
                    return self.fail(ConditionCode::SeqError);
                };
                if page.info_fails {
                    return self.fail(ConditionCode::Bummer);
                }
                *info = page.info.clone();
                ReturnCode::Success
            },
            (DataArgType::IMAGELAYOUT, msg, Payload::ImageLayout(layout)) => match msg {
                Msg::GET | Msg::GETCURRENT => {
                    *layout = self.layout;
                    ReturnCode::Success
                },
                Msg::GETDEFAULT | Msg::RESET => {
                    self.layout = ImageLayout::default();
                    *layout = self.layout;
                    ReturnCode::Success
                },
                Msg::SET if !self.ui => {
                    self.layout = *layout;
                    ReturnCode::Success
                },
                _ => self.fail(ConditionCode::SeqError),
            },
            (DataArgType::SETUPMEMXFER, Msg::GET, Payload::SetupMemXfer(setup)) => {
                *setup = SetupMemXfer {
                    min_buf_size: 256,
                    max_buf_size: 64 * 1024,
                    preferred: self.script.preferred_strip,
                };
                ReturnCode::Success
            },
            (DataArgType::IMAGEMEMXFER, Msg::GET, Payload::ImageMemXfer(strip)) => self.strip(strip),
            (
                DataArgType::IMAGENATIVEXFER | DataArgType::AUDIONATIVEXFER,
                Msg::GET,
                Payload::NativeXfer(slot),
            ) => self.native(slot),
            (DataArgType::SETUPFILEXFER, msg, Payload::SetupFileXfer(setup)) => match msg {
                Msg::GET | Msg::GETCURRENT => {
                    *setup = self.file.clone();
                    ReturnCode::Success
                },
                Msg::SET => {
                    self.file = setup.clone();
                    ReturnCode::Success
                },
                _ => self.fail(ConditionCode::BadProtocol),
            },
            (DataArgType::IMAGEFILEXFER | DataArgType::AUDIOFILEXFER, Msg::GET, Payload::None) => self.file_transfer(),
            (DataArgType::AUDIOINFO, Msg::GET, Payload::AudioInfo(info)) => {
                if !self.xfer_ready {
                    return self.fail(ConditionCode::SeqError);
                }
                *info = AudioInfo { name: format!("{} clip {}", self.script.name, self.cursor + 1), reserved: 0 };
                ReturnCode::Success
            },
            (DataArgType::DEVICEEVENT, Msg::GET, Payload::DeviceEvent(event)) => {
                match self.script.device_events.pop_front() {
                    Some(next) => {
                        *event = next;
                        ReturnCode::Success
                    },
                    None => self.fail(ConditionCode::SeqError),
                }
            },
            (DataArgType::EVENT, Msg::PROCESSEVENT, Payload::Event(event)) => self.process_event(event),
            _ => self.fail(ConditionCode::BadProtocol),
        }
    }

    fn process_event(&mut self, event: &mut PlatformEvent) -> ReturnCode {
        if !self.ui {
            return ReturnCode::NotDsEvent;
        }
        match self.legacy_queue.pop_front() {
            Some(message) => {
                event.message = message;
                ReturnCode::DsEvent
            },
            None => ReturnCode::NotDsEvent,
        }
    }

    fn pending_call(&mut self, msg: Msg, pending: &mut PendingXfers) -> ReturnCode {
        match msg {
            Msg::GET => {},
            Msg::ENDXFER => {
                if !self.xfer_ready {
                    return self.fail(ConditionCode::SeqError);
                }
                self.cursor += 1;
                self.attempts = 0;
                self.strip_offset = 0;
            },
            Msg::RESET => {
                self.cursor = self.script.pages.len();
                self.attempts = 0;
                self.strip_offset = 0;
            },
            Msg::STOPFEEDER => {
                let keep = (self.cursor + 1).min(self.script.pages.len());
                self.script.pages.truncate(keep);
            },
            _ => return self.fail(ConditionCode::BadProtocol),
        }
        *pending = PendingXfers { count: self.pending(), end_of_job: 0 };
        if pending.count == 0 {
            self.xfer_ready = false;
        }
        ReturnCode::Success
    }

    /// Failure and cancel scripting at the start of a unit transfer.
    fn gate(&mut self) -> Option<ReturnCode> {
        let Some(page) = self.current_page().filter(|_| self.xfer_ready) else {
            return Some(self.fail(ConditionCode::SeqError));
        };
        if page.cancel {
            return Some(ReturnCode::Cancel);
        }
        if self.attempts < page.transfer_failures {
            self.attempts += 1;
            return Some(self.fail(ConditionCode::OperationError));
        }
        None
    }

    fn native(&mut self, slot: &mut Option<MemHandle>) -> ReturnCode {
        if let Some(code) = self.gate() {
            return code;
        }
        let (Some(memory), Some(page)) = (self.memory.clone(), self.current_page()) else {
            return self.fail(ConditionCode::SeqError);
        };
        match write_block(memory.as_ref(), &page.data) {
            Some(handle) => {
                *slot = Some(handle);
                self.transfers += 1;
                ReturnCode::XferDone
            },
            None => self.fail(ConditionCode::LowMemory),
        }
    }

    fn strip(&mut self, strip: &mut ImageMemXfer) -> ReturnCode {
        if self.strip_offset == 0 {
            if let Some(code) = self.gate() {
                return code;
            }
        }
        let (Some(memory), Some(page), Some(handle)) =
            (self.memory.clone(), self.current_page(), strip.memory_handle)
        else {
            return self.fail(ConditionCode::BadValue);
        };

        let total = page.data.len();
        let start = self.strip_offset.min(total);
        let len = (total - start).min(strip.memory_length as usize);
        let chunk = page.data[start..start + len].to_vec();
        let row = usize::try_from(page.info.image_width).unwrap_or(1).max(1);

        let written = memory.lock(handle).and_then(|_| {
            let written = memory.write(handle, 0, &chunk);
            memory.unlock(handle)?;
            written
        });
        if written.is_err() {
            return self.fail(ConditionCode::LowMemory);
        }

        self.strip_offset = start + len;
        strip.bytes_written = len as u32;
        strip.rows = (len / row) as u32;
        if self.strip_offset >= total {
            self.transfers += 1;
            ReturnCode::XferDone
        } else {
            ReturnCode::Success
        }
    }

    fn file_transfer(&mut self) -> ReturnCode {
        if let Some(code) = self.gate() {
            return code;
        }
        let Some(page) = self.current_page() else {
            return self.fail(ConditionCode::SeqError);
        };
        match fs::write(&self.file.path, &page.data) {
            Ok(()) => {
                self.transfers += 1;
                ReturnCode::XferDone
            },
            Err(error) => {
                tracing::debug!(path = %self.file.path.display(), %error, "simulated file write failed");
                self.fail(ConditionCode::FileWriteError)
            },
        }
    }

    fn capability_call(&mut self, msg: Msg, record: &mut CapabilityRecord) -> ReturnCode {
        let cap = record.cap;
        let Some(memory) = self.memory.clone() else {
            return self.fail(ConditionCode::SeqError);
        };

        if msg == Msg::RESETALL {
            for capability in self.script.caps.values_mut().filter(|capability| !capability.read_only) {
                capability.current = capability.default.clone();
            }
            return ReturnCode::Success;
        }

        if cap == CapabilityId::CAP_SUPPORTEDCAPS && matches!(msg, Msg::GET | Msg::GETCURRENT) {
            if !self.script.lists_supported_caps {
                return self.fail(ConditionCode::CapUnsupported);
            }
            let values = self
                .script
                .caps
                .keys()
                .chain([&CapabilityId::CAP_SUPPORTEDCAPS])
                .map(|cap| CapValue::UInt16(cap.0))
                .collect();
            return self.reply(memory.as_ref(), record, &Container::Array { item_type: ItemType::UInt16, values });
        }

        let answer = match msg {
            Msg::GET | Msg::GETCURRENT | Msg::GETDEFAULT | Msg::RESET => {
                let Some(capability) = self.script.caps.get_mut(&cap) else {
                    return self.fail(ConditionCode::CapUnsupported);
                };
                if msg == Msg::RESET {
                    if capability.read_only {
                        return self.fail(ConditionCode::CapBadOperation);
                    }
                    capability.current = capability.default.clone();
                }
                capability.answer(msg)
            },
            Msg::QUERYSUPPORT => {
                let Some(capability) = self.script.caps.get(&cap) else {
                    return self.fail(ConditionCode::CapUnsupported);
                };
                Container::one(ItemType::Int32, CapValue::Int32(capability.support.bits() as i32))
            },
            Msg::SET | Msg::SETCONSTRAINT => return self.write(memory.as_ref(), msg, record),
            _ => return self.fail(ConditionCode::CapBadOperation),
        };
        self.reply(memory.as_ref(), record, &answer)
    }

    fn write(&mut self, memory: &dyn MemoryBroker, msg: Msg, record: &CapabilityRecord) -> ReturnCode {
        let cap = record.cap;
        let Some(container) = read_container(memory, record) else {
            return self.fail(ConditionCode::BadValue);
        };
        self.writes.push(CapabilityWrite { cap, msg, container: container.clone() });

        let Some(capability) = self.script.caps.get_mut(&cap) else {
            return self.fail(ConditionCode::CapUnsupported);
        };
        if capability.read_only {
            return self.fail(ConditionCode::CapBadOperation);
        }

        match container {
            Container::OneValue { value, .. } => {
                if !capability.accepts(&value) {
                    return self.fail(ConditionCode::BadValue);
                }
                capability.current = value;
            },
            list => {
                if let Some(current) = list.current() {
                    capability.current = current.clone();
                }
                capability.allowed = list;
            },
        }
        if cap == CapabilityId::ICAP_PIXELTYPE {
            self.follow_pixel_type();
        }
        ReturnCode::Success
    }

    /// Bit depth tracks pixel type: black and white 1, gray 8, color 24.
    fn follow_pixel_type(&mut self) {
        let depth = match self.script.caps.get(&CapabilityId::ICAP_PIXELTYPE).map(SimCapability::current) {
            Some(CapValue::UInt16(0)) => 1,
            Some(CapValue::UInt16(1)) => 8,
            Some(CapValue::UInt16(2)) => 24,
            _ => return,
        };
        if let Some(bit_depth) = self.script.caps.get_mut(&CapabilityId::ICAP_BITDEPTH) {
            bit_depth.current = CapValue::UInt16(depth);
        }
    }

    fn reply(&mut self, memory: &dyn MemoryBroker, record: &mut CapabilityRecord, container: &Container) -> ReturnCode {
        let Ok(bytes) = container.encode() else {
            return self.fail(ConditionCode::Bummer);
        };
        match write_block(memory, &bytes) {
            Some(handle) => {
                record.container = Some(handle);
                record.con_type = container.shape().to_u16();
                ReturnCode::Success
            },
            None => self.fail(ConditionCode::LowMemory),
        }
    }
}

/// Allocate an unlocked block holding `bytes`.
fn write_block(memory: &dyn MemoryBroker, bytes: &[u8]) -> Option<MemHandle> {
    let handle = memory.allocate(bytes.len().max(1)).ok()?;
    let written = memory.lock(handle).and_then(|_| {
        let written = memory.write(handle, 0, bytes);
        memory.unlock(handle)?;
        written
    });
    match written {
        Ok(()) => Some(handle),
        Err(_) => {
            let _ = memory.free(handle);
            None
        },
    }
}

/// Read the container an application handed over, leaving the block to it.
fn read_container(memory: &dyn MemoryBroker, record: &CapabilityRecord) -> Option<Container> {
    let handle = record.container?;
    let shape = ContainerShape::from_u16(record.con_type).ok()?;
    memory.lock(handle).ok()?;
    let bytes = memory.size(handle).and_then(|size| memory.read(handle, 0, size));
    memory.unlock(handle).ok()?;
    Container::decode(shape, &bytes.ok()?, ItemType::Unknown).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_pages_are_deterministic() {
        let a = SimPage::seeded(7, 16, 4);
        let b = SimPage::seeded(7, 16, 4);
        let c = SimPage::seeded(8, 16, 4);
        assert_eq!(a.data, b.data);
        assert_ne!(a.data, c.data);
        assert_eq!(a.data.len(), 64);
    }

    #[test]
    fn enumeration_answer_tracks_current() {
        let mut capability = SimCapability::enumeration(
            ItemType::UInt16,
            vec![CapValue::UInt16(0), CapValue::UInt16(2)],
            0,
        );
        capability.current = CapValue::UInt16(2);
        assert!(matches!(capability.answer(Msg::GET), Container::Enumeration { current_index: 1, .. }));
        assert_eq!(capability.answer(Msg::GETDEFAULT), Container::one(ItemType::UInt16, CapValue::UInt16(0)));
    }

    #[test]
    fn range_accepts_only_values_within_bounds() {
        let capability = SimCapability::range(
            ItemType::Fix32,
            CapValue::Fix32(50.0),
            CapValue::Fix32(600.0),
            CapValue::Fix32(1.0),
            CapValue::Fix32(300.0),
        );
        assert!(capability.accepts(&CapValue::Fix32(600.0)));
        assert!(!capability.accepts(&CapValue::Fix32(601.0)));
    }
}
