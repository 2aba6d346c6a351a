use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::invoker::{SnapshotInvoker, SnapshotResult};
use crate::session::{NodeSession, SessionError};

/// Where a run is in the lock lifecycle. Transitions happen only inside
/// `QuiesceController`; external code observes them, it never sets them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LockState {
    Unlocked,
    LockRequested,
    LockConfirmed,
    Unlocking,
    Done,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::Unlocked => "unlocked",
            LockState::LockRequested => "lock-requested",
            LockState::LockConfirmed => "lock-confirmed",
            LockState::Unlocking => "unlocking",
            LockState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum QuiesceError {
    #[error("connection to {host} failed: {source}")]
    Connection { host: String, source: SessionError },
    #[error("flush-and-lock rejected by {host}: {source}")]
    LockRejected { host: String, source: SessionError },
    #[error("in-progress operation query on {host} failed: {source}")]
    Introspection { host: String, source: SessionError },
    #[error("lock on {host} not confirmed within {timeout_ms} ms")]
    LockConfirmationTimeout { host: String, timeout_ms: u64 },
    #[error("snapshot of {host} failed: {detail}")]
    SnapshotFailed { host: String, detail: String },
    #[error("failed to unlock {host}: {source}")]
    CriticalUnlockFailure { host: String, source: SessionError },
    #[error("interrupted while {state} on {host}")]
    Cancelled { host: String, state: LockState },
}

impl QuiesceError {
    /// Process exit code for a run that terminated with this error. Each
    /// failure class gets its own code so operators can branch on it.
    pub fn exit_code(&self) -> i32 {
        match self {
            QuiesceError::Connection { .. } => 3,
            QuiesceError::LockRejected { .. } => 4,
            QuiesceError::Introspection { .. } => 5,
            QuiesceError::LockConfirmationTimeout { .. } => 5,
            QuiesceError::SnapshotFailed { .. } => 6,
            QuiesceError::CriticalUnlockFailure { .. } => 7,
            QuiesceError::Cancelled { .. } => 130,
        }
    }

    /// True for the one failure mode that needs operator intervention: the
    /// node may still be write-locked.
    pub fn is_critical(&self) -> bool {
        matches!(self, QuiesceError::CriticalUnlockFailure { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuiescePolicy {
    /// Sleep between lock-confirmation polls.
    pub poll_interval: Duration,
    /// Overall deadline for the lock to be confirmed stable.
    pub lock_timeout: Duration,
}

/// Drives one host through lock -> confirm -> snapshot -> unlock.
///
/// The ordering guarantees live here: the snapshot never starts before the
/// in-progress operation list has drained, and once the lock command succeeds
/// the unlock is attempted exactly once on every path out of `run`, whatever
/// the snapshot did. `run` consumes the controller, so a second lock without
/// an intervening unlock is unrepresentable.
pub struct QuiesceController<'a, S: NodeSession> {
    session: S,
    invoker: &'a dyn SnapshotInvoker,
    policy: QuiescePolicy,
    cancel: Arc<AtomicBool>,
    state: LockState,
}

impl<'a, S: NodeSession> QuiesceController<'a, S> {
    pub fn new(
        session: S,
        invoker: &'a dyn SnapshotInvoker,
        policy: QuiescePolicy,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            session,
            invoker,
            policy,
            cancel,
            state: LockState::Unlocked,
        }
    }

    /// Run the full sequence. `observe` fires on every state transition so the
    /// caller can report progress and record which state was reached.
    pub fn run(
        mut self,
        observe: &mut dyn FnMut(LockState),
    ) -> Result<SnapshotResult, QuiesceError> {
        let outcome = self.drive(observe);
        self.session.close();
        outcome
    }

    fn drive(
        &mut self,
        observe: &mut dyn FnMut(LockState),
    ) -> Result<SnapshotResult, QuiesceError> {
        if self.cancelled() {
            return Err(self.cancelled_err());
        }

        self.lock(observe)?;

        if let Err(err) = self.await_lock_confirmed(observe) {
            return Err(self.unlock_then_surface(err, observe));
        }
        if self.cancelled() {
            let err = self.cancelled_err();
            return Err(self.unlock_then_surface(err, observe));
        }

        // May block for as long as the volume operation takes. Whatever it
        // returns, the lock comes off next.
        let result = self.invoker.snapshot(self.session.host());
        self.unlock(observe)?;
        self.transition(LockState::Done, observe);

        if result.success {
            Ok(result)
        } else {
            Err(QuiesceError::SnapshotFailed {
                host: self.session.host().to_string(),
                detail: result
                    .detail
                    .unwrap_or_else(|| "no detail reported".to_string()),
            })
        }
    }

    fn lock(&mut self, observe: &mut dyn FnMut(LockState)) -> Result<(), QuiesceError> {
        self.session
            .flush_and_lock()
            .map_err(|source| QuiesceError::LockRejected {
                host: self.session.host().to_string(),
                source,
            })?;
        self.transition(LockState::LockRequested, observe);
        Ok(())
    }

    /// The flush-and-lock command returns before its effect is stable across
    /// in-flight operations. Poll the operation list until no operation is
    /// still holding the flush lock, bounded by the policy deadline.
    fn await_lock_confirmed(
        &mut self,
        observe: &mut dyn FnMut(LockState),
    ) -> Result<(), QuiesceError> {
        let deadline = Instant::now() + self.policy.lock_timeout;
        loop {
            if self.cancelled() {
                return Err(self.cancelled_err());
            }
            let pending =
                self.session
                    .in_flight_lock_ops()
                    .map_err(|source| QuiesceError::Introspection {
                        host: self.session.host().to_string(),
                        source,
                    })?;
            if pending == 0 {
                self.transition(LockState::LockConfirmed, observe);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(QuiesceError::LockConfirmationTimeout {
                    host: self.session.host().to_string(),
                    timeout_ms: self.policy.lock_timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.policy.poll_interval);
        }
    }

    /// Exactly-once unlock. A no-op when nothing is locked, so error paths can
    /// call it unconditionally.
    fn unlock(&mut self, observe: &mut dyn FnMut(LockState)) -> Result<(), QuiesceError> {
        if matches!(self.state, LockState::Unlocked | LockState::Done) {
            return Ok(());
        }
        self.transition(LockState::Unlocking, observe);
        self.session
            .flush_unlock()
            .map_err(|source| QuiesceError::CriticalUnlockFailure {
                host: self.session.host().to_string(),
                source,
            })?;
        Ok(())
    }

    /// Best-effort cleanup for failures that happen while the node is locked:
    /// attempt the unlock, then surface the original error. A failed unlock
    /// outranks whatever went wrong first.
    fn unlock_then_surface(
        &mut self,
        err: QuiesceError,
        observe: &mut dyn FnMut(LockState),
    ) -> QuiesceError {
        match self.unlock(observe) {
            Ok(()) => err,
            Err(critical) => critical,
        }
    }

    fn transition(&mut self, next: LockState, observe: &mut dyn FnMut(LockState)) {
        self.state = next;
        observe(next);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn cancelled_err(&self) -> QuiesceError {
        QuiesceError::Cancelled {
            host: self.session.host().to_string(),
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Lock,
        Poll,
        Snapshot,
        Unlock,
        Close,
    }

    type CallLog = Rc<RefCell<Vec<Call>>>;

    struct FakeSession {
        log: CallLog,
        /// Per-poll counts of in-flight lock operations; exhausting the script
        /// reports zero.
        pending: VecDeque<usize>,
        /// Node that never drains its in-flight lock operations.
        stuck: bool,
        reject_lock: bool,
        fail_unlock: bool,
        /// Trip the shared cancel flag on the first poll, simulating an
        /// operator interrupt mid-confirmation.
        trip_cancel: Option<Arc<AtomicBool>>,
    }

    impl FakeSession {
        fn new(log: &CallLog, pending: &[usize]) -> Self {
            Self {
                log: Rc::clone(log),
                pending: pending.iter().copied().collect(),
                stuck: false,
                reject_lock: false,
                fail_unlock: false,
                trip_cancel: None,
            }
        }
    }

    impl NodeSession for FakeSession {
        fn host(&self) -> &str {
            "db-1"
        }

        fn flush_and_lock(&mut self) -> Result<(), SessionError> {
            self.log.borrow_mut().push(Call::Lock);
            if self.reject_lock {
                return Err(SessionError::Command("fsync lock already held".into()));
            }
            Ok(())
        }

        fn flush_unlock(&mut self) -> Result<(), SessionError> {
            self.log.borrow_mut().push(Call::Unlock);
            if self.fail_unlock {
                return Err(SessionError::Command("fsyncUnlock refused".into()));
            }
            Ok(())
        }

        fn in_flight_lock_ops(&mut self) -> Result<usize, SessionError> {
            self.log.borrow_mut().push(Call::Poll);
            if let Some(flag) = &self.trip_cancel {
                flag.store(true, Ordering::SeqCst);
            }
            if self.stuck {
                return Ok(1);
            }
            Ok(self.pending.pop_front().unwrap_or(0))
        }

        fn close(&mut self) {
            self.log.borrow_mut().push(Call::Close);
        }
    }

    struct FakeInvoker {
        log: CallLog,
        success: bool,
    }

    impl SnapshotInvoker for FakeInvoker {
        fn name(&self) -> &str {
            "fake-invoker"
        }

        fn snapshot(&self, host: &str) -> SnapshotResult {
            self.log.borrow_mut().push(Call::Snapshot);
            SnapshotResult {
                host: host.to_string(),
                success: self.success,
                detail: (!self.success).then(|| "volume snapshot failed".to_string()),
            }
        }
    }

    fn policy(timeout_ms: u64) -> QuiescePolicy {
        QuiescePolicy {
            poll_interval: Duration::from_millis(1),
            lock_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn count(log: &CallLog, call: Call) -> usize {
        log.borrow().iter().filter(|c| **c == call).count()
    }

    /// A lock is never issued while a previous lock is still outstanding.
    fn assert_lock_discipline(log: &CallLog) {
        let mut outstanding = 0u32;
        for call in log.borrow().iter() {
            match call {
                Call::Lock => {
                    assert_eq!(outstanding, 0, "lock issued while already locked");
                    outstanding += 1;
                }
                Call::Unlock => {
                    assert!(outstanding > 0, "unlock without a preceding lock");
                    outstanding -= 1;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn confirmed_lock_then_snapshot_then_unlock() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let session = FakeSession::new(&log, &[0]);
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        let mut seen = Vec::new();
        let result = controller.run(&mut |state| seen.push(state));

        assert!(result.unwrap().success);
        assert_eq!(
            seen,
            vec![
                LockState::LockRequested,
                LockState::LockConfirmed,
                LockState::Unlocking,
                LockState::Done
            ]
        );
        assert_eq!(
            *log.borrow(),
            vec![Call::Lock, Call::Poll, Call::Snapshot, Call::Unlock, Call::Close]
        );
        assert_lock_discipline(&log);
    }

    #[test]
    fn polls_until_in_flight_lock_ops_drain() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        // Two in-flight lock ops that clear one per poll: the controller must
        // poll three times and only then confirm.
        let session = FakeSession::new(&log, &[2, 1, 0]);
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        let mut seen = Vec::new();
        controller.run(&mut |state| seen.push(state)).unwrap();

        assert_eq!(count(&log, Call::Poll), 3);
        // The snapshot only appears after the third poll.
        let log = log.borrow();
        let last_poll = log.iter().rposition(|c| *c == Call::Poll).unwrap();
        let snapshot = log.iter().position(|c| *c == Call::Snapshot).unwrap();
        assert!(snapshot > last_poll);
    }

    #[test]
    fn confirmation_timeout_triggers_unlock() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let mut session = FakeSession::new(&log, &[]);
        session.stuck = true;
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(10),
            Arc::new(AtomicBool::new(false)),
        );

        let started = Instant::now();
        let err = controller.run(&mut |_| {}).unwrap_err();

        assert!(matches!(err, QuiesceError::LockConfirmationTimeout { .. }));
        // Bounded by timeout + poll interval, with generous slack for CI.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(count(&log, Call::Snapshot), 0);
        assert_eq!(count(&log, Call::Unlock), 1);
        assert_eq!(count(&log, Call::Close), 1);
        assert_lock_discipline(&log);
    }

    #[test]
    fn snapshot_failure_still_unlocks() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: false };
        let session = FakeSession::new(&log, &[0]);
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        let err = controller.run(&mut |_| {}).unwrap_err();

        match err {
            QuiesceError::SnapshotFailed { host, detail } => {
                assert_eq!(host, "db-1");
                assert_eq!(detail, "volume snapshot failed");
            }
            other => panic!("expected SnapshotFailed, got {other:?}"),
        }
        // Unlock happens after the snapshot returned, exactly once.
        let calls = log.borrow().clone();
        let snapshot = calls.iter().position(|c| *c == Call::Snapshot).unwrap();
        let unlock = calls.iter().position(|c| *c == Call::Unlock).unwrap();
        assert!(unlock > snapshot);
        assert_eq!(count(&log, Call::Unlock), 1);
        assert_lock_discipline(&log);
    }

    #[test]
    fn rejected_lock_is_fatal_without_cleanup() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let mut session = FakeSession::new(&log, &[0]);
        session.reject_lock = true;
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        let err = controller.run(&mut |_| {}).unwrap_err();

        assert!(matches!(err, QuiesceError::LockRejected { .. }));
        assert_eq!(err.exit_code(), 4);
        // No lock was taken, so nothing to snapshot and nothing to unlock.
        assert_eq!(count(&log, Call::Snapshot), 0);
        assert_eq!(count(&log, Call::Unlock), 0);
        assert_eq!(count(&log, Call::Close), 1);
    }

    #[test]
    fn unlock_failure_is_critical() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let mut session = FakeSession::new(&log, &[0]);
        session.fail_unlock = true;
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        let err = controller.run(&mut |_| {}).unwrap_err();

        assert!(err.is_critical());
        assert_eq!(err.exit_code(), 7);
    }

    #[test]
    fn failed_cleanup_unlock_outranks_timeout() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let mut session = FakeSession::new(&log, &[]);
        session.stuck = true;
        session.fail_unlock = true;
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(5),
            Arc::new(AtomicBool::new(false)),
        );

        let err = controller.run(&mut |_| {}).unwrap_err();
        assert!(matches!(err, QuiesceError::CriticalUnlockFailure { .. }));
    }

    #[test]
    fn cancelled_before_lock_takes_nothing() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let session = FakeSession::new(&log, &[0]);
        let controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(true)),
        );

        let err = controller.run(&mut |_| {}).unwrap_err();

        assert!(matches!(
            err,
            QuiesceError::Cancelled { state: LockState::Unlocked, .. }
        ));
        assert_eq!(*log.borrow(), vec![Call::Close]);
    }

    #[test]
    fn interrupt_during_confirmation_unlocks() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let cancel = Arc::new(AtomicBool::new(false));
        let mut session = FakeSession::new(&log, &[]);
        session.stuck = true;
        session.trip_cancel = Some(Arc::clone(&cancel));
        let controller = QuiesceController::new(session, &invoker, policy(60_000), cancel);

        let err = controller.run(&mut |_| {}).unwrap_err();

        assert!(matches!(
            err,
            QuiesceError::Cancelled { state: LockState::LockRequested, .. }
        ));
        assert_eq!(count(&log, Call::Snapshot), 0);
        assert_eq!(count(&log, Call::Unlock), 1);
        assert_lock_discipline(&log);
    }

    #[test]
    fn unlock_is_a_noop_when_nothing_is_locked() {
        let log: CallLog = Rc::default();
        let invoker = FakeInvoker { log: Rc::clone(&log), success: true };
        let session = FakeSession::new(&log, &[0]);
        let mut controller = QuiesceController::new(
            session,
            &invoker,
            policy(1000),
            Arc::new(AtomicBool::new(false)),
        );

        // Never locked: no unlock command may reach the node.
        controller.unlock(&mut |_| {}).unwrap();
        assert_eq!(count(&log, Call::Unlock), 0);

        // Already unlocked and done: still a no-op, not an error.
        controller.state = LockState::Done;
        controller.unlock(&mut |_| {}).unwrap();
        assert_eq!(count(&log, Call::Unlock), 0);
    }

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let host = "db-1".to_string();
        let timeout = QuiesceError::LockConfirmationTimeout { host: host.clone(), timeout_ms: 1 };
        let snapshot = QuiesceError::SnapshotFailed { host: host.clone(), detail: "x".into() };
        let cancelled = QuiesceError::Cancelled { host, state: LockState::LockConfirmed };
        assert_eq!(timeout.exit_code(), 5);
        assert_eq!(snapshot.exit_code(), 6);
        assert_ne!(timeout.exit_code(), snapshot.exit_code());
        assert_eq!(cancelled.exit_code(), 130);
    }
}
