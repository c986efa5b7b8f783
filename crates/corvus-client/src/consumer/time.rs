// Deadline carrier for nested waits. Deadlines propagate through the gate
// and the receive buffer as a single value so the overall budget stays exact.
use tokio::time::{Duration, Instant};

/// A wait budget with first-class zero and infinite values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeTracker {
    /// Do not block at all.
    Zero,
    /// Block without bound.
    Infinite,
    /// Block until the given instant.
    Until(Instant),
}

impl TimeTracker {
    /// Budget expiring `duration` from now. A zero duration is the zero
    /// sentinel, not an instant in the past.
    pub(crate) fn after(duration: Duration) -> Self {
        if duration.is_zero() {
            TimeTracker::Zero
        } else {
            TimeTracker::Until(Instant::now() + duration)
        }
    }

    /// Remaining budget; `None` means unbounded. Saturates at zero once the
    /// deadline has passed.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        match self {
            TimeTracker::Zero => Some(Duration::ZERO),
            TimeTracker::Infinite => None,
            TimeTracker::Until(deadline) => {
                Some(deadline.saturating_duration_since(Instant::now()))
            }
        }
    }

    pub(crate) fn timed_out(&self) -> bool {
        match self {
            TimeTracker::Zero => true,
            TimeTracker::Infinite => false,
            TimeTracker::Until(deadline) => Instant::now() >= *deadline,
        }
    }
}
