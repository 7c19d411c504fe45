//! A listener that records what it hears.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use scanbridge_core::{Listener, Notification, Verdict};

/// Records every notification and answers transfer-ready prompts from a
/// per-page script.
#[derive(Debug, Default)]
pub struct RecordingListener {
    log: Mutex<Vec<Notification>>,
    verdicts: Mutex<HashMap<u32, Verdict>>,
}

impl RecordingListener {
    /// Listener that lets every unit through.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer the transfer-ready prompt for `page` with `verdict`.
    pub fn answer(&self, page: u32, verdict: Verdict) {
        lock(&self.verdicts).insert(page, verdict);
    }

    /// Everything heard so far.
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.log).clone()
    }

    /// The most recent notification.
    pub fn last(&self) -> Option<Notification> {
        lock(&self.log).last().cloned()
    }

    /// Variant names of everything heard so far.
    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.log).iter().map(name).collect()
    }

    /// Number of notifications with a given variant name.
    pub fn count(&self, variant: &str) -> usize {
        lock(&self.log).iter().filter(|notification| name(notification) == variant).count()
    }

    /// Forget everything heard.
    pub fn clear(&self) {
        lock(&self.log).clear();
    }
}

impl Listener for RecordingListener {
    fn notify(&self, notification: &Notification) -> Verdict {
        let verdict = match notification {
            Notification::TransferReady { page, .. } => {
                lock(&self.verdicts).get(page).copied().unwrap_or_default()
            },
            _ => Verdict::Continue,
        };
        lock(&self.log).push(notification.clone());
        verdict
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Variant name of a notification.
pub fn name(notification: &Notification) -> &'static str {
    match notification {
        Notification::AcquireStarted { .. } => "AcquireStarted",
        Notification::TransferReady { .. } => "TransferReady",
        Notification::PageTransferred { .. } => "PageTransferred",
        Notification::PageDiscarded { .. } => "PageDiscarded",
        Notification::TransferCancelled { .. } => "TransferCancelled",
        Notification::AcquireDone { .. } => "AcquireDone",
        Notification::AcquireDoneNoImages { .. } => "AcquireDoneNoImages",
        Notification::DeviceEvent { .. } => "DeviceEvent",
        Notification::UiOpening { .. } => "UiOpening",
        Notification::UiOpened { .. } => "UiOpened",
        Notification::UiClosing { .. } => "UiClosing",
        Notification::UiClosed { .. } => "UiClosed",
        Notification::ImageInfoError { .. } => "ImageInfoError",
        Notification::Error { .. } => "Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_verdicts_apply_to_their_page_only() {
        let listener = RecordingListener::new();
        listener.answer(2, Verdict::DiscardPage);

        let ready = |page| Notification::TransferReady { source: "Alpha".into(), page, info: None };
        assert_eq!(listener.notify(&ready(1)), Verdict::Continue);
        assert_eq!(listener.notify(&ready(2)), Verdict::DiscardPage);
        assert_eq!(listener.count("TransferReady"), 2);
    }
}
