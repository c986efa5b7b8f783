// Admission gate for the synchronous receive path. Entry is only possible
// while the gate is open; a connection stop closes it and waits for the
// occupants to drain, and close aborts anyone still parked at it.
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::consumer::time::TimeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Open,
    Closed,
    Aborted,
}

struct GateInner {
    state: GateState,
    occupancy: usize,
}

/// Outcome of an entry attempt.
pub(crate) enum Entered<'gate> {
    /// Admitted; dropping the guard releases the slot.
    Admitted(GateGuard<'gate>),
    TimedOut,
    Aborted,
}

/// Occupancy token. Exists so a cancelled receive future still releases its
/// slot; an exit without a matching enter is impossible by construction.
pub(crate) struct GateGuard<'gate> {
    gate: &'gate ReceiveGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.exit();
    }
}

pub(crate) struct ReceiveGate {
    inner: Mutex<GateInner>,
    // Wakes entrants whenever the state changes.
    state_changed: Notify,
    // Wakes wait_to_clear when occupancy reaches zero.
    cleared: Notify,
}

impl ReceiveGate {
    pub(crate) fn new(open: bool) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: if open { GateState::Open } else { GateState::Closed },
                occupancy: 0,
            }),
            state_changed: Notify::new(),
            cleared: Notify::new(),
        }
    }

    /// Block while the gate is closed, until it opens (enter and return a
    /// guard), the budget runs out, or the gate is aborted.
    pub(crate) async fn enter(&self, deadline: TimeTracker) -> Entered<'_> {
        loop {
            // Register interest before checking state so a concurrent
            // open_gate cannot slip between the check and the wait.
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("gate lock");
                match inner.state {
                    GateState::Open => {
                        inner.occupancy += 1;
                        return Entered::Admitted(GateGuard { gate: self });
                    }
                    GateState::Aborted => return Entered::Aborted,
                    GateState::Closed => {}
                }
            }
            match deadline.remaining() {
                None => notified.await,
                Some(budget) if budget.is_zero() => return Entered::TimedOut,
                Some(budget) => {
                    if timeout(budget, notified).await.is_err() {
                        return Entered::TimedOut;
                    }
                }
            }
        }
    }

    fn exit(&self) {
        let mut inner = self.inner.lock().expect("gate lock");
        debug_assert!(inner.occupancy > 0, "gate exit without matching enter");
        inner.occupancy = inner.occupancy.saturating_sub(1);
        if inner.occupancy == 0 {
            self.cleared.notify_waiters();
        }
    }

    /// Open (or reopen after an abort) and wake everyone parked at entry.
    pub(crate) fn open_gate(&self) {
        self.inner.lock().expect("gate lock").state = GateState::Open;
        self.state_changed.notify_waiters();
    }

    /// New entrants block; current occupants are unaffected.
    pub(crate) fn close_gate(&self) {
        self.inner.lock().expect("gate lock").state = GateState::Closed;
    }

    /// Turn away everyone parked at entry and anyone arriving until the gate
    /// is reopened.
    pub(crate) fn abort_waiters(&self) {
        self.inner.lock().expect("gate lock").state = GateState::Aborted;
        self.state_changed.notify_waiters();
    }

    /// Wait until no occupant remains. Returns false if the budget ran out
    /// first.
    pub(crate) async fn wait_to_clear(&self, deadline: TimeTracker) -> bool {
        loop {
            let notified = self.cleared.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.lock().expect("gate lock").occupancy == 0 {
                return true;
            }
            match deadline.remaining() {
                None => notified.await,
                Some(budget) if budget.is_zero() => return false,
                Some(budget) => {
                    if timeout(budget, notified).await.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
