// Lifecycle broadcast over the consumer's live broker interactions.
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A resource that follows the connection lifecycle: `start` on resume,
/// `stop` on a connection stop, `abort` on close. Implementations log their
/// own failures; a broadcast must reach every member.
#[async_trait]
pub(crate) trait Abortable: Send + Sync {
    async fn start(&self);
    async fn stop(&self);
    async fn abort(&self);
}

#[derive(Clone, Copy)]
enum Action {
    Start,
    Stop,
    Abort,
}

/// Bag of abortables that broadcasts each lifecycle action to every member.
/// A nested broadcast of the same action (a member re-triggering the bag it
/// lives in) is a no-op.
#[derive(Default)]
pub(crate) struct AbortableSet {
    members: Mutex<Vec<Arc<dyn Abortable>>>,
    starting: AtomicBool,
    stopping: AtomicBool,
    aborting: AtomicBool,
}

impl AbortableSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, member: Arc<dyn Abortable>) {
        self.members.lock().expect("abortables lock").push(member);
    }

    /// Remove a member that completed on its own. Identity comparison, not
    /// equality.
    pub(crate) fn remove(&self, member: &Arc<dyn Abortable>) {
        self.members
            .lock()
            .expect("abortables lock")
            .retain(|candidate| !Arc::ptr_eq(candidate, member));
    }

    pub(crate) async fn start(&self) {
        self.act(&self.starting, Action::Start).await;
    }

    pub(crate) async fn stop(&self) {
        self.act(&self.stopping, Action::Stop).await;
    }

    pub(crate) async fn abort(&self) {
        self.act(&self.aborting, Action::Abort).await;
    }

    async fn act(&self, in_progress: &AtomicBool, action: Action) {
        if in_progress.swap(true, Ordering::AcqRel) {
            return;
        }
        let members: Vec<Arc<dyn Abortable>> =
            self.members.lock().expect("abortables lock").clone();
        for member in members {
            match action {
                Action::Start => member.start().await,
                Action::Stop => member.stop().await,
                Action::Abort => member.abort().await,
            }
        }
        in_progress.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        starts: AtomicUsize,
        stops: AtomicUsize,
        aborts: AtomicUsize,
    }

    #[async_trait]
    impl Abortable for Counter {
        async fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        async fn abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn broadcasts_reach_every_member() {
        let set = AbortableSet::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        set.add(first.clone());
        set.add(second.clone());
        set.start().await;
        set.stop().await;
        set.abort().await;
        for counter in [&first, &second] {
            assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
            assert_eq!(counter.stops.load(Ordering::SeqCst), 1);
            assert_eq!(counter.aborts.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn removed_member_is_skipped() {
        let set = AbortableSet::new();
        let member = Arc::new(Counter::default());
        set.add(member.clone());
        let handle: Arc<dyn Abortable> = member.clone();
        set.remove(&handle);
        set.stop().await;
        assert_eq!(member.stops.load(Ordering::SeqCst), 0);
    }

    struct Reentrant {
        set: Arc<AbortableSet>,
        inner_stops: AtomicUsize,
    }

    #[async_trait]
    impl Abortable for Reentrant {
        async fn start(&self) {}
        async fn stop(&self) {
            // A member stopping the bag it lives in must not recurse.
            self.set.stop().await;
            self.inner_stops.fetch_add(1, Ordering::SeqCst);
        }
        async fn abort(&self) {}
    }

    #[tokio::test]
    async fn nested_broadcast_of_same_action_is_noop() {
        let set = Arc::new(AbortableSet::new());
        let member = Arc::new(Reentrant {
            set: set.clone(),
            inner_stops: AtomicUsize::new(0),
        });
        set.add(member.clone());
        set.stop().await;
        assert_eq!(member.inner_stops.load(Ordering::SeqCst), 1);
    }
}
