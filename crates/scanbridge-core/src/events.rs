//! Driver-pushed events.
//!
//! Sources announce transfer readiness, close requests and device events
//! asynchronously. 2.x sources post them through an [`EventSender`]
//! registered with the callback triplet; legacy sources hand them back
//! from the process-event triplet and the session enqueues them itself.
//! Either way they land in one [`EventQueue`] and are delivered strictly
//! in arrival order.

use std::sync::mpsc;

use scanbridge_proto::Msg;

/// Event a source can push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverEvent {
    /// A transfer is ready
    XferReady,
    /// The user asked to close the source's interface
    CloseRequest,
    /// The user confirmed the interface (UI-only mode)
    CloseOk,
    /// A device event is available
    DeviceEvent,
    /// Nothing happened
    Null,
}

impl DriverEvent {
    /// Event carried by a message code, if any.
    pub fn from_msg(msg: Msg) -> Option<Self> {
        match msg {
            Msg::XFERREADY => Some(Self::XferReady),
            Msg::CLOSEDSREQ => Some(Self::CloseRequest),
            Msg::CLOSEDSOK => Some(Self::CloseOk),
            Msg::DEVICEEVENT => Some(Self::DeviceEvent),
            Msg::NULL => Some(Self::Null),
            _ => None,
        }
    }

    /// Message code of the event.
    pub fn msg(self) -> Msg {
        match self {
            Self::XferReady => Msg::XFERREADY,
            Self::CloseRequest => Msg::CLOSEDSREQ,
            Self::CloseOk => Msg::CLOSEDSOK,
            Self::DeviceEvent => Msg::DEVICEEVENT,
            Self::Null => Msg::NULL,
        }
    }
}

/// An event tagged with the id of the source that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Broker-assigned source id
    pub source_id: u32,
    /// The event
    pub event: DriverEvent,
}

/// Sending half handed to sources.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventEnvelope>,
}

impl EventSender {
    /// Post a message from a source. Returns false for messages that are not
    /// events or when the session is gone.
    pub fn post(&self, source_id: u32, msg: Msg) -> bool {
        DriverEvent::from_msg(msg).is_some_and(|event| self.send(EventEnvelope { source_id, event }))
    }

    /// Enqueue an already decoded event.
    pub fn send(&self, envelope: EventEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

/// Arrival-ordered event queue owned by a session.
#[derive(Debug)]
pub struct EventQueue {
    tx: mpsc::Sender<EventEnvelope>,
    rx: mpsc::Receiver<EventEnvelope>,
}

impl EventQueue {
    /// Empty queue.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    /// A sender feeding this queue.
    pub fn sender(&self) -> EventSender {
        EventSender { tx: self.tx.clone() }
    }

    /// Next queued event, if any.
    pub fn try_next(&self) -> Option<EventEnvelope> {
        self.rx.try_recv().ok()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
