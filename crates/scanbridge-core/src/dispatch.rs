//! Triplet dispatch.
//!
//! Every call to the entry point goes through [`Dispatcher::execute`], which
//! adds the guarantees the raw entry point cannot give:
//!
//! - **Liveness**: a triplet built against a closed session is rejected with
//!   [`DispatchError::TripletNotExecuted`] and never reaches the broker.
//! - **Payload registry**: the payload must be the kind registered for the
//!   argument type.
//! - **Fault containment**: a panic inside the driver becomes
//!   [`DispatchError::DriverFault`]. It is never retried.
//! - **Watchdog**: when a timeout is configured, calls not on the exempt
//!   list run on a worker thread. If the worker does not answer in time the
//!   call is abandoned and reported as [`DispatchError::Timeout`]. At most
//!   one watchdog is armed process-wide and it is disarmed on every return
//!   path.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Duration,
};

use scanbridge_proto::ReturnCode;

use crate::{
    entry::{DriverEntry, PayloadKind, PayloadSummary},
    error::DispatchError,
    triplet::{Reply, Triplet},
};

/// Shared flag saying whether the owning session is still registered.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    /// A live token.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether triplets may still be executed.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Reject every later triplet.
    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

static WATCHDOG: Mutex<()> = Mutex::new(());

/// The process-wide watchdog slot. Arming waits for any other armed call;
/// dropping disarms.
struct ArmedWatchdog {
    _slot: MutexGuard<'static, ()>,
}

impl ArmedWatchdog {
    fn arm() -> Self {
        Self { _slot: WATCHDOG.lock().unwrap_or_else(PoisonError::into_inner) }
    }
}

/// Executes triplets against one driver entry point.
pub struct Dispatcher {
    entry: Arc<dyn DriverEntry>,
    liveness: Liveness,
    timeout: Option<Duration>,
    log_triplets: bool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("alive", &self.liveness.is_alive())
            .field("timeout", &self.timeout)
            .field("log_triplets", &self.log_triplets)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Dispatcher bound to an entry point and a liveness token.
    pub fn new(
        entry: Arc<dyn DriverEntry>,
        liveness: Liveness,
        timeout: Option<Duration>,
        log_triplets: bool,
    ) -> Self {
        Self { entry, liveness, timeout, log_triplets }
    }

    /// Liveness token this dispatcher checks.
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Execute one triplet.
    ///
    /// # Errors
    ///
    /// - `TripletNotExecuted` if the session is closed
    /// - `PayloadMismatch` if the payload is not the registered kind
    /// - `DriverFault` if the driver panicked
    /// - `Timeout` if the watchdog expired
    pub fn execute(&self, triplet: Triplet) -> Result<Reply, DispatchError> {
        let (dat, msg) = (triplet.dat, triplet.msg);
        if !self.liveness.is_alive() {
            return Err(DispatchError::TripletNotExecuted { dat, msg });
        }

        let expected = PayloadKind::for_argument(dat);
        let found = triplet.payload.kind();
        if expected != Some(found) {
            return Err(DispatchError::PayloadMismatch { dat, expected, found });
        }

        if self.log_triplets {
            tracing::debug!(
                origin = triplet.origin.id,
                dest = triplet.dest.as_ref().map(|d| d.id),
                group = ?triplet.group,
                ?dat,
                ?msg,
                payload = %PayloadSummary(&triplet.payload),
                "triplet call"
            );
        }

        let reply = match self.timeout {
            Some(after) if !triplet.is_timeout_exempt() => self.call_watched(triplet, after)?,
            _ => invoke(self.entry.as_ref(), triplet)?,
        };

        if self.log_triplets {
            tracing::debug!(
                ?dat,
                ?msg,
                code = ?reply.code,
                origin = reply.origin.id,
                payload = %PayloadSummary(&reply.payload),
                "triplet return"
            );
        }
        Ok(reply)
    }

    fn call_watched(&self, triplet: Triplet, after: Duration) -> Result<Reply, DispatchError> {
        let (dat, msg) = (triplet.dat, triplet.msg);
        let _armed = ArmedWatchdog::arm();

        let entry = Arc::clone(&self.entry);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new().name("scanbridge-call".into()).spawn(move || {
            let _ = tx.send(invoke(entry.as_ref(), triplet));
        });
        if spawned.is_err() {
            return Err(DispatchError::DriverFault { dat, msg });
        }

        match rx.recv_timeout(after) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(?dat, ?msg, ?after, "watchdog expired, call abandoned");
                Err(DispatchError::Timeout { dat, msg, after })
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DispatchError::DriverFault { dat, msg }),
        }
    }
}

fn invoke(entry: &dyn DriverEntry, triplet: Triplet) -> Result<Reply, DispatchError> {
    let Triplet { mut origin, dest, group, dat, msg, mut payload } = triplet;
    let raw = catch_unwind(AssertUnwindSafe(|| {
        entry.call(&mut origin, dest.as_ref(), group, dat, msg, &mut payload)
    }));
    match raw {
        Ok(raw) => Ok(Reply { code: ReturnCode::from_u16(raw), origin, payload }),
        Err(_) => {
            tracing::warn!(?dat, ?msg, "driver fault contained");
            Err(DispatchError::DriverFault { dat, msg })
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use scanbridge_proto::{DataArgType, DataGroup, Identity, Msg, payloads::PendingXfers};

    use super::*;
    use crate::entry::Payload;

    /// Answers every call with a fixed code and counts invocations.
    struct Fixed {
        code: u16,
        calls: AtomicUsize,
        delay: Option<Duration>,
        fault: bool,
    }

    impl Fixed {
        fn new(code: u16) -> Self {
            Self { code, calls: AtomicUsize::new(0), delay: None, fault: false }
        }
    }

    impl DriverEntry for Fixed {
        fn call(
            &self,
            origin: &mut Identity,
            _dest: Option<&Identity>,
            _group: DataGroup,
            _dat: DataArgType,
            _msg: Msg,
            payload: &mut Payload,
        ) -> u16 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            assert!(!self.fault, "driver crashed");
            origin.id = 42;
            if let Payload::PendingXfers(pending) = payload {
                pending.count = 0;
            }
            self.code
        }
    }

    fn app() -> Identity {
        Identity::application("Acme", "Imaging", "Capture")
    }

    fn end_xfer() -> Triplet {
        Triplet::control(
            &app(),
            Some(&Identity::source("Flatbed")),
            DataArgType::PENDINGXFERS,
            Msg::ENDXFER,
            Payload::PendingXfers(PendingXfers { count: 3, end_of_job: 0 }),
        )
    }

    #[test]
    fn reply_carries_code_and_payload() {
        let entry = Arc::new(Fixed::new(6));
        let dispatcher = Dispatcher::new(entry, Liveness::new(), None, true);

        let reply = dispatcher.execute(end_xfer()).unwrap();
        assert_eq!(reply.code, ReturnCode::XferDone);
        assert_eq!(reply.origin.id, 42);
        assert!(matches!(reply.payload, Payload::PendingXfers(PendingXfers { count: 0, .. })));
    }

    #[test]
    fn dead_session_never_reaches_the_driver() {
        let entry = Arc::new(Fixed::new(0));
        let liveness = Liveness::new();
        let dispatcher = Dispatcher::new(entry.clone(), liveness.clone(), None, false);

        liveness.revoke();
        let err = dispatcher.execute(end_xfer()).unwrap_err();

        assert_eq!(
            err,
            DispatchError::TripletNotExecuted { dat: DataArgType::PENDINGXFERS, msg: Msg::ENDXFER }
        );
        assert_eq!(entry.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn payload_must_match_argument_type() {
        let entry = Arc::new(Fixed::new(0));
        let dispatcher = Dispatcher::new(entry.clone(), Liveness::new(), None, false);

        let triplet =
            Triplet::control(&app(), None, DataArgType::STATUS, Msg::GET, Payload::Parent(0));
        let err = dispatcher.execute(triplet).unwrap_err();

        assert!(matches!(err, DispatchError::PayloadMismatch { found: PayloadKind::Parent, .. }));
        assert_eq!(entry.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn driver_panic_becomes_fault() {
        let entry = Arc::new(Fixed { fault: true, ..Fixed::new(0) });
        let dispatcher = Dispatcher::new(entry, Liveness::new(), None, false);

        let err = dispatcher.execute(end_xfer()).unwrap_err();
        assert_eq!(err, DispatchError::DriverFault { dat: DataArgType::PENDINGXFERS, msg: Msg::ENDXFER });
    }

    #[test]
    fn watchdog_abandons_slow_call_and_disarms() {
        let entry = Arc::new(Fixed { delay: Some(Duration::from_millis(500)), ..Fixed::new(0) });
        let dispatcher =
            Dispatcher::new(entry, Liveness::new(), Some(Duration::from_millis(20)), false);

        let err = dispatcher.execute(end_xfer()).unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));

        // Disarmed: the next watched call is not blocked behind the abandoned one
        let entry = Arc::new(Fixed::new(0));
        let dispatcher = Dispatcher::new(entry, Liveness::new(), Some(Duration::from_secs(5)), false);
        assert_eq!(dispatcher.execute(end_xfer()).unwrap().code, ReturnCode::Success);
    }

    #[test]
    fn exempt_call_is_not_watched() {
        let entry = Arc::new(Fixed { delay: Some(Duration::from_millis(60)), ..Fixed::new(0) });
        let dispatcher =
            Dispatcher::new(entry, Liveness::new(), Some(Duration::from_millis(10)), false);

        let source = Identity::source("Flatbed");
        let triplet = Triplet::image(
            &app(),
            &source,
            DataArgType::IMAGENATIVEXFER,
            Msg::GET,
            Payload::NativeXfer(None),
        );
        assert_eq!(dispatcher.execute(triplet).unwrap().code, ReturnCode::Success);
    }

    #[test]
    fn watched_fast_call_returns_normally() {
        let entry = Arc::new(Fixed::new(0));
        let dispatcher =
            Dispatcher::new(entry, Liveness::new(), Some(Duration::from_secs(5)), false);

        assert_eq!(dispatcher.execute(end_xfer()).unwrap().code, ReturnCode::Success);
    }
}
