//! Reaction to source events.
//!
//! Events are handled one at a time on the host's thread. Transfer
//! readiness runs the whole acquisition loop: fetch metadata, ask the
//! listeners, transfer, conclude, until the source reports nothing
//! pending. Close requests pass through [`DeferredClose`] first, since some
//! sources ask to close before they ever signal readiness.

use scanbridge_proto::{
    CapValue, CapabilityId, DataArgType, ItemType, Msg, ReturnCode,
    payloads::{AudioInfo, DeviceEvent},
};

use super::{
    Source,
    transfer::{UnitContext, UnitMetadata, UnitOutcome},
};
use crate::{
    config::DeferredClosePolicy,
    entry::{Payload, PayloadKind, PlatformEvent},
    error::{DispatchError, ErrorRecord, SourceError},
    events::DriverEvent,
    notify::{Notification, Verdict},
    state::{SourceState, Transition},
};

/// Why the interface is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The source asked to close
    Requested,
    /// A deferred close request met transfer readiness
    Latched,
    /// Too many events went by after a deferred close request
    Forced,
}

/// Close bookkeeping for one source.
///
/// A source on the allow-list may ask to close before it signals transfer
/// readiness. Its request is latched rather than honored, and the interface
/// closes once readiness has also been seen, or once `threshold` further
/// events have arrived without it. Other sources close on request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredClose {
    applies: bool,
    threshold: u32,
    xfer_ready_seen: bool,
    close_seen: bool,
    events_after_close: u32,
}

impl DeferredClose {
    /// Tracker for the named product.
    pub fn new(policy: &DeferredClosePolicy, product_name: &str) -> Self {
        Self {
            applies: policy.applies_to(product_name),
            threshold: policy.threshold,
            xfer_ready_seen: false,
            close_seen: false,
            events_after_close: 0,
        }
    }

    /// Whether the product is on the allow-list.
    pub fn applies(&self) -> bool {
        self.applies
    }

    /// Whether readiness has been seen since the last reset.
    pub fn xfer_ready_seen(&self) -> bool {
        self.xfer_ready_seen
    }

    /// Whether a close request is latched.
    pub fn close_seen(&self) -> bool {
        self.close_seen
    }

    /// Events seen after the latched close request.
    pub fn events_after_close(&self) -> u32 {
        self.events_after_close
    }

    /// Record an event. Returns a reason when the interface should close.
    pub fn observe(&mut self, event: DriverEvent) -> Option<CloseReason> {
        let is_close = matches!(event, DriverEvent::CloseRequest | DriverEvent::CloseOk);
        if is_close && !self.applies {
            return Some(CloseReason::Requested);
        }

        if self.close_seen {
            self.events_after_close = self.events_after_close.saturating_add(1);
        } else if is_close {
            self.close_seen = true;
        }
        if event == DriverEvent::XferReady {
            self.xfer_ready_seen = true;
        }

        if self.close_seen && self.xfer_ready_seen {
            Some(CloseReason::Latched)
        } else if self.close_seen && self.events_after_close >= self.threshold {
            Some(CloseReason::Forced)
        } else {
            None
        }
    }

    /// Forget both latches and the counter.
    pub fn reset(&mut self) {
        self.xfer_ready_seen = false;
        self.close_seen = false;
        self.events_after_close = 0;
    }
}

/// Answer of a legacy source offered a host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventClaim {
    /// The message was not for this source
    NotOurs,
    /// The source consumed the message, possibly raising an event
    Ours(Option<DriverEvent>),
}

impl Source {
    /// React to one event from the source.
    ///
    /// Readiness runs the acquisition loop to completion before this
    /// returns. Events that arrive while the interface is not enabled are
    /// logged and otherwise ignored.
    pub fn handle_event(&mut self, event: DriverEvent) -> Result<(), SourceError> {
        if self.poisoned {
            return Err(SourceError::Poisoned);
        }
        tracing::debug!(source = %self.name(), ?event, state = ?self.state(), "source event");

        let handled = match event {
            DriverEvent::XferReady => self.on_xfer_ready(),
            DriverEvent::DeviceEvent => self.on_device_event(),
            DriverEvent::CloseRequest | DriverEvent::CloseOk | DriverEvent::Null => Ok(()),
        };
        if self.poisoned {
            return handled;
        }

        let closed = match self.deferred.observe(event) {
            Some(reason) if self.state() > SourceState::Opened => self.close_ui(reason),
            Some(_) | None => Ok(()),
        };
        handled.and(closed)
    }

    fn close_ui(&mut self, reason: CloseReason) -> Result<(), SourceError> {
        match reason {
            CloseReason::Forced => tracing::warn!(
                source = %self.name(),
                events = self.deferred.events_after_close(),
                "closing interface without transfer readiness"
            ),
            reason => tracing::debug!(source = %self.name(), ?reason, "closing interface"),
        }

        if matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            self.reset_transfers()?;
        }
        if self.state() == SourceState::UIEnabled {
            self.disable()?;
        }
        Ok(())
    }

    fn on_device_event(&mut self) -> Result<(), SourceError> {
        let payload = Payload::DeviceEvent(DeviceEvent::default());
        match self.fetch(self.control(DataArgType::DEVICEEVENT, Msg::GET, payload))? {
            Ok(payload) => {
                let event = take_payload!(payload, DataArgType::DEVICEEVENT, DeviceEvent);
                self.notify(Notification::DeviceEvent { source: self.name().to_owned(), event });
                Ok(())
            },
            Err(record) => Err(self.report(DataArgType::DEVICEEVENT, Msg::GET, record)),
        }
    }

    fn on_xfer_ready(&mut self) -> Result<(), SourceError> {
        self.machine.check(Transition::XferReady)?;
        self.machine.commit(Transition::XferReady, ReturnCode::Success);
        self.cache.on_state_change(self.state());

        let (pixel_type, bit_depth) = self.pixel_snapshot();
        let (pages, result) = self.acquire_units(pixel_type, bit_depth);
        if self.poisoned {
            return result;
        }

        if result.is_err() && matches!(self.state(), SourceState::XferReady | SourceState::Transferring) {
            if let Err(error) = self.pending_xfers(Msg::RESET) {
                tracing::warn!(source = %self.name(), %error, "reset after failed transfer failed");
            }
            self.machine.set_pending(0);
        }
        self.finish_transfers();

        let source = self.name().to_owned();
        tracing::info!(%source, pages, "acquisition finished");
        if pages > 0 {
            self.notify(Notification::AcquireDone { source, pages });
        } else {
            self.notify(Notification::AcquireDoneNoImages { source });
        }

        if self.acquisition.close_ui_after_acquire && self.state() == SourceState::UIEnabled {
            let disabled = self.disable();
            return result.and(disabled);
        }
        result
    }

    /// Transfer units until none is pending. Returns the pages acquired
    /// alongside the error that stopped the loop, if any.
    fn acquire_units(
        &mut self,
        pixel_type: Option<u16>,
        bit_depth: Option<u16>,
    ) -> (u32, Result<(), SourceError>) {
        let source = self.name().to_owned();
        let mut pages = 0;
        let mut page = 0;
        let mut last: Option<UnitMetadata> = None;
        let mut unit = UnitContext::default();
        let mut retrying = false;

        loop {
            if !retrying {
                page += 1;
                match self.fetch_metadata() {
                    Err(error) => return (pages, Err(error)),
                    Ok(Ok(metadata)) => last = Some(metadata),
                    Ok(Err(record)) if self.acquisition.skip_image_info_errors => {
                        tracing::warn!(%source, page, condition = %record.condition, "metadata unavailable");
                        let condition = record.condition;
                        self.last_error = Some(record);
                        self.notify(Notification::ImageInfoError { source: source.clone(), condition });
                    },
                    Ok(Err(record)) => match self.unit_failed(record, false) {
                        Ok(report) if report.outcome == UnitOutcome::MorePending => continue,
                        Ok(_) => return (pages, Ok(())),
                        Err(error) => return (pages, Err(error)),
                    },
                }
                unit = UnitContext { page, metadata: last.clone(), pixel_type, bit_depth };

                let info = last.as_ref().and_then(UnitMetadata::image).cloned();
                match self.notify(Notification::TransferReady { source: source.clone(), page, info }) {
                    Verdict::Continue => {},
                    Verdict::StopFeeder => {
                        tracing::info!(%source, page, "feeder stopped by listener");
                        if let Err(error) = self.stop_feeder() {
                            return (pages, Err(error));
                        }
                    },
                    Verdict::DiscardPage => {
                        tracing::info!(%source, page, "unit discarded by listener");
                        let pending = match self.pending_xfers(Msg::ENDXFER) {
                            Ok(pending) => pending,
                            Err(error) => return (pages, Err(error)),
                        };
                        self.machine.unit_completed();
                        self.notify(Notification::PageDiscarded { source: source.clone(), page });
                        if pending.has_more() {
                            continue;
                        }
                        return (pages, Ok(()));
                    },
                    Verdict::AbortAcquisition => {
                        tracing::info!(%source, page, "acquisition aborted by listener");
                        let reset = self.pending_xfers(Msg::RESET).map(|_| self.machine.set_pending(0));
                        self.notify(Notification::TransferCancelled { source: source.clone() });
                        return (pages, reset);
                    },
                }
            }

            if self.machine.commit(Transition::BeginTransfer, ReturnCode::Success) {
                self.cache.on_state_change(self.state());
            }
            let report = match self.transfer_unit(&unit) {
                Ok(report) => report,
                Err(error) => return (pages, Err(error)),
            };
            if report.acquired {
                pages += 1;
            }

            match report.outcome {
                UnitOutcome::RetryUnit => retrying = true,
                UnitOutcome::NoMorePending => return (pages, Ok(())),
                UnitOutcome::MorePending => {
                    retrying = false;
                    if self.acquisition.max_pages.is_some_and(|max| pages >= max) {
                        tracing::info!(%source, pages, "page limit reached");
                        let reset = self.pending_xfers(Msg::RESET).map(|_| self.machine.set_pending(0));
                        return (pages, reset);
                    }
                },
            }
        }
    }

    fn fetch_metadata(&mut self) -> Result<Result<UnitMetadata, ErrorRecord>, SourceError> {
        if !self.acquisition.mode.is_audio() {
            return Ok(self.fetch_image_info()?.map(UnitMetadata::Image));
        }

        let payload = Payload::AudioInfo(AudioInfo::default());
        match self.fetch(self.audio(DataArgType::AUDIOINFO, Msg::GET, payload))? {
            Ok(payload) => {
                let info = take_payload!(payload, DataArgType::AUDIOINFO, AudioInfo);
                Ok(Ok(UnitMetadata::Audio(info)))
            },
            Err(record) => Ok(Err(record)),
        }
    }

    /// Pixel type and bit depth in effect when the source became ready.
    fn pixel_snapshot(&mut self) -> (Option<u16>, Option<u16>) {
        if self.acquisition.mode.is_audio() {
            return (None, None);
        }
        let mut current = |cap| {
            let decoded = self.read_capability(cap, Msg::GETCURRENT, ItemType::UInt16, false).ok()?;
            let value = decoded.container.current().and_then(CapValue::as_i64)?;
            u16::try_from(value).ok()
        };
        (current(CapabilityId::ICAP_PIXELTYPE), current(CapabilityId::ICAP_BITDEPTH))
    }

    /// Offer a host message to a source without callback support.
    pub(crate) fn process_event(&mut self, raw: u64) -> Result<EventClaim, SourceError> {
        let payload = Payload::Event(PlatformEvent { raw, message: Msg::NULL });
        let reply = self.call(self.control(DataArgType::EVENT, Msg::PROCESSEVENT, payload))?;
        let code = reply.code;
        let event = take_payload!(reply.payload, DataArgType::EVENT, Event);

        match code {
            // A consumed message with no event still counts toward a deferred close
            ReturnCode::DsEvent => Ok(EventClaim::Ours(DriverEvent::from_msg(event.message))),
            ReturnCode::NotDsEvent => Ok(EventClaim::NotOurs),
            code => {
                tracing::debug!(source = %self.name(), ?code, "unexpected answer to a host message");
                Ok(EventClaim::NotOurs)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(listed: bool, threshold: u32) -> DeferredClose {
        let products = if listed { vec!["Camera X".to_string()] } else { Vec::new() };
        DeferredClose::new(&DeferredClosePolicy { products, threshold }, "Camera X")
    }

    #[test]
    fn unlisted_source_closes_on_request() {
        let mut close = tracker(false, 4);
        assert_eq!(close.observe(DriverEvent::Null), None);
        assert_eq!(close.observe(DriverEvent::CloseRequest), Some(CloseReason::Requested));
        assert_eq!(close.observe(DriverEvent::CloseOk), Some(CloseReason::Requested));
    }

    #[test]
    fn listed_source_waits_for_readiness() {
        let mut close = tracker(true, 4);
        assert_eq!(close.observe(DriverEvent::CloseRequest), None);
        assert!(close.close_seen());
        assert_eq!(close.observe(DriverEvent::Null), None);
        assert_eq!(close.observe(DriverEvent::XferReady), Some(CloseReason::Latched));
    }

    #[test]
    fn readiness_first_then_close_latches_immediately() {
        let mut close = tracker(true, 4);
        assert_eq!(close.observe(DriverEvent::XferReady), None);
        assert_eq!(close.observe(DriverEvent::CloseRequest), Some(CloseReason::Latched));
    }

    #[test]
    fn close_is_forced_at_threshold() {
        let mut close = tracker(true, 4);
        assert_eq!(close.observe(DriverEvent::CloseRequest), None);
        for _ in 0..3 {
            assert_eq!(close.observe(DriverEvent::Null), None);
        }
        assert_eq!(close.observe(DriverEvent::DeviceEvent), Some(CloseReason::Forced));
        assert_eq!(close.events_after_close(), 4);
    }

    #[test]
    fn reset_forgets_latches() {
        let mut close = tracker(true, 4);
        close.observe(DriverEvent::CloseRequest);
        close.observe(DriverEvent::Null);
        close.reset();
        assert!(!close.close_seen());
        assert_eq!(close.events_after_close(), 0);
        assert_eq!(close.observe(DriverEvent::XferReady), None);
    }
}
