//! A connection to the broker.
//!
//! The session opens the broker, negotiates the 2.x memory table when both
//! sides speak it, enumerates and opens sources, and routes queued events
//! to the source that raised them. Closing the session closes every source
//! it opened and revokes its liveness token, so any triplet built against
//! it afterwards is rejected before reaching the driver.

use std::sync::{Arc, mpsc};

use scanbridge_proto::{
    ConditionCode, DataArgType, Identity, Msg, ReturnCode, SupportedGroups, payloads::Status,
};

use crate::{
    config::{AcquisitionConfig, SessionConfig},
    dispatch::{Dispatcher, Liveness},
    entry::{DriverEntry, Payload, PayloadKind},
    error::{DispatchError, ErrorRecord, SessionError},
    events::{EventEnvelope, EventQueue},
    memory::MemoryBroker,
    notify::{Listener, Notification, Notifier},
    source::{EventClaim, SessionLink, Source},
    state::SourceState,
    triplet::{Reply, Triplet},
};

/// Upper bound on enumerated sources, in case a broker never reports the
/// end of its list.
const MAX_SOURCES: usize = 256;

/// Whether a host message was consumed by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDisposition {
    /// A source claimed the message; the host must not dispatch it
    Consumed,
    /// No source wanted it
    NotConsumed,
}

/// An open broker connection and the sources opened through it.
#[derive(Debug)]
pub struct Session {
    link: SessionLink,
    queue: EventQueue,
    sources: Vec<Source>,
    selected: Option<String>,
    last_error: Option<ErrorRecord>,
    open: bool,
}

impl Session {
    /// Open the broker.
    ///
    /// `app` is the application identity; the broker assigns its id. When
    /// both the broker and the application speak 2.x, the broker's memory
    /// table is negotiated and used for every 2.x source; everything else
    /// uses `os_memory`.
    pub fn open(
        entry: Arc<dyn DriverEntry>,
        os_memory: Arc<dyn MemoryBroker>,
        app: Identity,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let dispatcher = Arc::new(Dispatcher::new(
            entry,
            Liveness::new(),
            config.watchdog_timeout,
            config.log_triplets,
        ));

        let payload = Payload::Parent(config.parent_window);
        let reply = dispatcher.execute(broker_triplet(&app, DataArgType::PARENT, Msg::OPENDSM, payload))?;
        if !reply.code.is_success() {
            let condition = broker_status(&dispatcher, &reply.origin);
            dispatcher.liveness().revoke();
            tracing::warn!(code = ?reply.code, %condition, "broker refused to open");
            return Err(SessionError::OpenFailed { return_code: reply.code, condition });
        }

        let app = reply.origin;
        let negotiated = if app.supported_groups.contains(SupportedGroups::DSM2 | SupportedGroups::APP2) {
            negotiate_memory(&dispatcher, &app)
        } else {
            None
        };
        tracing::info!(app = app.id, negotiated = negotiated.is_some(), "broker opened");

        let queue = EventQueue::new();
        let link = SessionLink {
            app,
            dispatcher,
            notifier: Arc::new(Notifier::new()),
            os_memory,
            negotiated,
            events: queue.sender(),
            config,
        };
        Ok(Self { link, queue, sources: Vec::new(), selected: None, last_error: None, open: true })
    }

    /// Application identity with its assigned id.
    pub fn app(&self) -> &Identity {
        &self.link.app
    }

    /// Whether the session is still open.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Dispatcher shared by the session and its sources.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.link.dispatcher)
    }

    /// Whether a negotiated memory table is available.
    pub fn has_negotiated_memory(&self) -> bool {
        self.link.negotiated.is_some()
    }

    /// Most recent session-level failure.
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    /// Add a listener for every source's notifications.
    pub fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.link.notifier.register(listener);
    }

    /// Also post every notification to a channel.
    pub fn post_to(&self, sender: mpsc::Sender<Notification>) {
        self.link.notifier.post_to(sender);
    }

    /// Notification fan-out shared with the sources.
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.link.notifier
    }

    /// Every source the broker knows about.
    pub fn sources(&mut self) -> Result<Vec<Identity>, SessionError> {
        self.require_open()?;
        let mut found = Vec::new();
        let mut msg = Msg::GETFIRST;

        loop {
            if found.len() >= MAX_SOURCES {
                tracing::warn!(count = found.len(), "source list truncated");
                break;
            }
            let reply = self.broker_call(DataArgType::IDENTITY, msg, Payload::Identity(Identity::default()))?;
            match reply.code {
                ReturnCode::Success => found.push(identity_of(reply.payload)?),
                ReturnCode::EndOfList => break,
                code => return Err(self.fail(DataArgType::IDENTITY, msg, code)),
            }
            msg = Msg::GETNEXT;
        }
        Ok(found)
    }

    /// The broker's default source.
    pub fn default_source(&mut self) -> Result<Identity, SessionError> {
        self.require_open()?;
        let payload = Payload::Identity(Identity::default());
        let reply = self.broker_call(DataArgType::IDENTITY, Msg::GETDEFAULT, payload)?;
        if !reply.code.is_success() {
            return Err(self.fail(DataArgType::IDENTITY, Msg::GETDEFAULT, reply.code));
        }
        identity_of(reply.payload)
    }

    /// Let the user pick a source. Returns `None` if they cancelled.
    pub fn user_select(&mut self) -> Result<Option<Identity>, SessionError> {
        self.require_open()?;
        let payload = Payload::Identity(Identity::default());
        let reply = self.broker_call(DataArgType::IDENTITY, Msg::USERSELECT, payload)?;
        match reply.code {
            ReturnCode::Success => Ok(Some(identity_of(reply.payload)?)),
            ReturnCode::Cancel => Ok(None),
            code => Err(self.fail(DataArgType::IDENTITY, Msg::USERSELECT, code)),
        }
    }

    /// Open a source by product name.
    pub fn open_source(
        &mut self,
        product_name: &str,
        acquisition: AcquisitionConfig,
    ) -> Result<&mut Source, SessionError> {
        self.require_open()?;
        if self.source(product_name).is_some() {
            return Err(SessionError::DuplicateSource(product_name.to_owned()));
        }

        let mut source = Source::new(self.link.clone(), product_name, acquisition);
        if let Err(error) = source.open() {
            self.last_error = source.last_error().cloned();
            return Err(error.into());
        }
        self.sources.push(source);
        self.sources.last_mut().ok_or_else(|| SessionError::UnknownSource(product_name.to_owned()))
    }

    /// An open source.
    pub fn source(&self, product_name: &str) -> Option<&Source> {
        self.sources.iter().find(|source| source.name() == product_name)
    }

    /// An open source, mutably.
    pub fn source_mut(&mut self, product_name: &str) -> Option<&mut Source> {
        self.sources.iter_mut().find(|source| source.name() == product_name)
    }

    /// Every open source.
    pub fn open_sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    /// Close one source and forget it.
    pub fn close_source(&mut self, product_name: &str) -> Result<(), SessionError> {
        let index = self
            .sources
            .iter()
            .position(|source| source.name() == product_name)
            .ok_or_else(|| SessionError::UnknownSource(product_name.to_owned()))?;

        let mut source = self.sources.remove(index);
        if self.selected.as_deref() == Some(product_name) {
            self.selected = None;
        }
        source.close()?;
        Ok(())
    }

    /// Make an open source the selected one.
    pub fn select(&mut self, product_name: &str) -> Result<(), SessionError> {
        if self.source(product_name).is_none() {
            return Err(SessionError::UnknownSource(product_name.to_owned()));
        }
        self.selected = Some(product_name.to_owned());
        Ok(())
    }

    /// The selected source.
    pub fn selected(&self) -> Option<&Source> {
        self.selected.as_deref().and_then(|name| self.source(name))
    }

    /// The selected source, mutably.
    pub fn selected_mut(&mut self) -> Option<&mut Source> {
        let name = self.selected.clone()?;
        self.source_mut(&name)
    }

    /// Offer a host message to every enabled source without callback
    /// support. Events they raise are queued for [`Session::pump_events`].
    pub fn process_event(&mut self, raw: u64) -> Result<EventDisposition, SessionError> {
        self.require_open()?;
        for source in &mut self.sources {
            if source.uses_callback() || source.is_poisoned() || source.state() < SourceState::UIEnabled {
                continue;
            }
            match source.process_event(raw)? {
                EventClaim::NotOurs => {},
                EventClaim::Ours(raised) => {
                    if let Some(event) = raised {
                        let envelope = EventEnvelope { source_id: source.identity().id, event };
                        self.link.events.send(envelope);
                    }
                    return Ok(EventDisposition::Consumed);
                },
            }
        }
        Ok(EventDisposition::NotConsumed)
    }

    /// Handle every queued event in arrival order. A failure is logged and
    /// recorded; it does not stop the remaining events. Returns the number
    /// of events taken from the queue.
    pub fn pump_events(&mut self) -> Result<usize, SessionError> {
        self.require_open()?;
        let mut taken = 0;

        while let Some(envelope) = self.queue.try_next() {
            taken += 1;
            let Some(source) =
                self.sources.iter_mut().find(|source| source.identity().id == envelope.source_id)
            else {
                tracing::debug!(id = envelope.source_id, event = ?envelope.event, "event for unknown source dropped");
                continue;
            };

            if let Err(error) = source.handle_event(envelope.event) {
                tracing::warn!(source = %source.name(), event = ?envelope.event, %error, "event handling failed");
                if let Some(record) = source.last_error() {
                    self.last_error = Some(record.clone());
                }
            }
        }
        Ok(taken)
    }

    /// Close every source, then the broker. Idempotent.
    ///
    /// Source failures are logged; the broker is closed and the session
    /// revoked regardless. The first failure is returned.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if !self.open {
            return Ok(());
        }

        let mut first_error: Option<SessionError> = None;
        for mut source in self.sources.drain(..) {
            if let Err(error) = source.force_close() {
                tracing::warn!(source = %source.name(), %error, "source close failed");
                first_error.get_or_insert(error.into());
            }
        }
        self.selected = None;

        let payload = Payload::Parent(self.link.config.parent_window);
        match self.broker_call(DataArgType::PARENT, Msg::CLOSEDSM, payload) {
            Ok(reply) if reply.code.is_success() => {},
            Ok(reply) => {
                let error = self.fail(DataArgType::PARENT, Msg::CLOSEDSM, reply.code);
                first_error.get_or_insert(error);
            },
            Err(error) => {
                first_error.get_or_insert(error);
            },
        }

        self.link.dispatcher.liveness().revoke();
        self.open = false;
        tracing::info!(app = self.link.app.id, "broker closed");

        first_error.map_or(Ok(()), Err)
    }

    fn require_open(&self) -> Result<(), SessionError> {
        if self.open { Ok(()) } else { Err(SessionError::Closed) }
    }

    fn broker_call(
        &self,
        dat: DataArgType,
        msg: Msg,
        payload: Payload,
    ) -> Result<Reply, SessionError> {
        Ok(self.link.dispatcher.execute(broker_triplet(&self.link.app, dat, msg, payload))?)
    }

    fn fail(&mut self, dat: DataArgType, msg: Msg, return_code: ReturnCode) -> SessionError {
        let condition = broker_status(&self.link.dispatcher, &self.link.app);
        let record = ErrorRecord::new(return_code, condition);
        tracing::warn!(?dat, ?msg, ?return_code, %condition, "broker call failed");
        self.link
            .notifier
            .notify(Notification::Error { source: None, error: record.clone() });
        self.last_error = Some(record);
        SessionError::Protocol { dat, msg, return_code, condition }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            tracing::warn!(%error, "session close on drop failed");
        }
    }
}

fn broker_triplet(app: &Identity, dat: DataArgType, msg: Msg, payload: Payload) -> Triplet {
    Triplet::control(app, None, dat, msg, payload)
}

/// Condition code of the broker itself.
fn broker_status(dispatcher: &Dispatcher, app: &Identity) -> ConditionCode {
    let payload = Payload::Status(Status::default());
    match dispatcher.execute(broker_triplet(app, DataArgType::STATUS, Msg::GET, payload)) {
        Ok(reply) if reply.code.is_success() => match reply.payload {
            Payload::Status(status) => status.condition,
            _ => ConditionCode::Bummer,
        },
        _ => ConditionCode::Bummer,
    }
}

fn negotiate_memory(dispatcher: &Dispatcher, app: &Identity) -> Option<Arc<dyn MemoryBroker>> {
    let payload = Payload::EntryPoint(None);
    match dispatcher.execute(broker_triplet(app, DataArgType::ENTRYPOINT, Msg::GET, payload)) {
        Ok(reply) => match (reply.code.is_success(), reply.payload) {
            (true, Payload::EntryPoint(Some(memory))) => Some(memory),
            (_, payload) => {
                tracing::warn!(code = ?reply.code, kind = ?payload.kind(), "no negotiated memory, using OS memory");
                None
            },
        },
        Err(error) => {
            tracing::warn!(%error, "entry point negotiation failed, using OS memory");
            None
        },
    }
}

fn identity_of(payload: Payload) -> Result<Identity, SessionError> {
    match payload {
        Payload::Identity(identity) => Ok(identity),
        other => Err(DispatchError::PayloadMismatch {
            dat: DataArgType::IDENTITY,
            expected: Some(PayloadKind::Identity),
            found: other.kind(),
        }
        .into()),
    }
}
