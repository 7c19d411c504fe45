//! Upstream notifications.
//!
//! Every observable step of an acquisition produces a [`Notification`].
//! Notifications go to each registered [`Listener`] in registration order
//! and, if configured, are also posted to a channel. Listeners answer
//! with a [`Verdict`]; only `TransferReady` consults it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};

use scanbridge_proto::{
    ConditionCode,
    payloads::{DeviceEvent, ImageInfo},
};

use crate::error::ErrorRecord;

/// Something the host may want to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The interface was enabled for acquisition
    AcquireStarted {
        /// Source product name
        source: String,
    },
    /// A unit is about to be transferred; listeners may veto
    TransferReady {
        /// Source product name
        source: String,
        /// 1-based page number of the unit
        page: u32,
        /// Image metadata, if any was obtained
        info: Option<ImageInfo>,
    },
    /// A unit was transferred
    PageTransferred {
        /// Source product name
        source: String,
        /// 1-based page number
        page: u32,
    },
    /// A listener discarded the unit
    PageDiscarded {
        /// Source product name
        source: String,
        /// 1-based page number
        page: u32,
    },
    /// The source or a listener cancelled
    TransferCancelled {
        /// Source product name
        source: String,
    },
    /// The acquisition finished with at least one page
    AcquireDone {
        /// Source product name
        source: String,
        /// Pages transferred
        pages: u32,
    },
    /// The acquisition finished without any page
    AcquireDoneNoImages {
        /// Source product name
        source: String,
    },
    /// A device event arrived
    DeviceEvent {
        /// Source product name
        source: String,
        /// Event details
        event: DeviceEvent,
    },
    /// The interface is about to be enabled
    UiOpening {
        /// Source product name
        source: String,
    },
    /// The interface was enabled
    UiOpened {
        /// Source product name
        source: String,
    },
    /// The interface is about to be disabled
    UiClosing {
        /// Source product name
        source: String,
    },
    /// The interface was disabled
    UiClosed {
        /// Source product name
        source: String,
    },
    /// Image metadata could not be fetched
    ImageInfoError {
        /// Source product name
        source: String,
        /// Condition code of the failure
        condition: ConditionCode,
    },
    /// An operation failed
    Error {
        /// Source product name, `None` for session-level failures
        source: Option<String>,
        /// The failure
        error: ErrorRecord,
    },
}

/// A listener's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Verdict {
    /// Go ahead
    #[default]
    Continue,
    /// Take this unit, then stop the feeder so no further sheet is pulled
    StopFeeder,
    /// Skip this unit, keep acquiring
    DiscardPage,
    /// Stop acquiring
    AbortAcquisition,
}

/// Receives notifications.
pub trait Listener: Send + Sync {
    /// Handle one notification.
    fn notify(&self, notification: &Notification) -> Verdict;
}

impl<F> Listener for F
where
    F: Fn(&Notification) -> Verdict + Send + Sync,
{
    fn notify(&self, notification: &Notification) -> Verdict {
        self(notification)
    }
}

#[derive(Default)]
struct Targets {
    listeners: Vec<Arc<dyn Listener>>,
    post: Option<mpsc::Sender<Notification>>,
}

/// Fan-out of notifications to listeners and an optional channel.
#[derive(Default)]
pub struct Notifier {
    targets: Mutex<Targets>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let targets = self.targets();
        f.debug_struct("Notifier")
            .field("listeners", &targets.listeners.len())
            .field("post", &targets.post.is_some())
            .finish()
    }
}

impl Notifier {
    /// No listeners.
    pub fn new() -> Self {
        Self::default()
    }

    fn targets(&self) -> MutexGuard<'_, Targets> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a listener.
    pub fn register(&self, listener: Arc<dyn Listener>) {
        self.targets().listeners.push(listener);
    }

    /// Also post every notification to a channel.
    pub fn post_to(&self, sender: mpsc::Sender<Notification>) {
        self.targets().post = Some(sender);
    }

    /// Deliver a notification. Returns the strongest verdict any listener
    /// gave.
    pub fn notify(&self, notification: Notification) -> Verdict {
        // Listeners may register others; call them without holding the lock
        let (listeners, post) = {
            let targets = self.targets();
            (targets.listeners.clone(), targets.post.clone())
        };

        let verdict = listeners
            .iter()
            .map(|listener| listener.notify(&notification))
            .max()
            .unwrap_or_default();

        if let Some(post) = post {
            if post.send(notification).is_err() {
                self.targets().post = None;
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn done() -> Notification {
        Notification::AcquireDone { source: "Flatbed".into(), pages: 1 }
    }

    #[test]
    fn strongest_verdict_wins() {
        let notifier = Notifier::new();
        notifier.register(Arc::new(|_: &Notification| Verdict::StopFeeder));
        notifier.register(Arc::new(|_: &Notification| Verdict::DiscardPage));
        notifier.register(Arc::new(|_: &Notification| Verdict::Continue));
        assert_eq!(notifier.notify(done()), Verdict::DiscardPage);

        notifier.register(Arc::new(|_: &Notification| Verdict::AbortAcquisition));
        assert_eq!(notifier.notify(done()), Verdict::AbortAcquisition);
    }

    #[test]
    fn no_listeners_means_continue() {
        assert_eq!(Notifier::new().notify(done()), Verdict::Continue);
    }

    #[test]
    fn posted_notifications_arrive_in_order() {
        let notifier = Notifier::new();
        let (tx, rx) = mpsc::channel();
        notifier.post_to(tx);

        notifier.notify(Notification::UiOpening { source: "Flatbed".into() });
        notifier.notify(Notification::UiOpened { source: "Flatbed".into() });

        assert_eq!(rx.recv().unwrap(), Notification::UiOpening { source: "Flatbed".into() });
        assert_eq!(rx.recv().unwrap(), Notification::UiOpened { source: "Flatbed".into() });
    }
}
