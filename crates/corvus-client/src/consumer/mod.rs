// Consumer core: routes synchronous receives through the admission gate and
// the receive buffer, drives the push listener, and owns the close protocol.
pub(crate) mod abortable;
pub(crate) mod buffer;
pub(crate) mod gate;
pub(crate) mod listener;
pub(crate) mod time;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use corvus_broker::{Channel, GetResponse};

use crate::destination::Destination;
use crate::message::Message;
use crate::session::Session;
use crate::{Error, Result};

use abortable::{Abortable, AbortableSet};
use buffer::{Fetched, ReceiveBuffer};
use gate::{Entered, ReceiveGate};
use listener::{ListenerConsumer, MessageListener};
use time::TimeTracker;

// Subscription tags are unique per session and stable for the life of one
// subscription.
pub(crate) fn new_consumer_tag() -> String {
    format!("jms-consumer-{}", Uuid::new_v4())
}

/// A consumer attached to one destination, serving blocking receives and an
/// optional push listener over disjoint broker subscriptions.
///
/// Sessions create consumers; dropping the session closes them. `receive*`
/// calls may run from any number of tasks concurrently, gated by the
/// connection's start/stop state.
pub struct Consumer {
    session: Weak<Session>,
    destination: Destination,
    // Doubles as the private queue name when the destination is a topic.
    unique_tag: String,
    queue_name: String,
    durable: bool,
    no_local: bool,
    auto_ack: bool,
    channel: Arc<dyn Channel>,
    closing: AtomicBool,
    closed: AtomicBool,
    listener: Mutex<Option<Arc<dyn MessageListener>>>,
    // Single atomic slot: at most one live listener subscription.
    listener_consumer: Mutex<Option<Arc<ListenerConsumer>>>,
    buffer: Arc<ReceiveBuffer>,
    gate: ReceiveGate,
    abortables: AbortableSet,
    stop_timeout: Duration,
    termination_timeout: Duration,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("destination", &self.destination)
            .field("unique_tag", &self.unique_tag)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl Consumer {
    pub(crate) fn new(
        session: &Arc<Session>,
        destination: Destination,
        unique_tag: String,
        paused: bool,
        durable: bool,
        no_local: bool,
    ) -> Arc<Self> {
        let config = session.config();
        let channel = session.channel().clone();
        let queue_name = if destination.is_queue() {
            destination.physical_name().to_string()
        } else {
            unique_tag.clone()
        };
        let buffer = ReceiveBuffer::new(
            channel.clone(),
            queue_name.clone(),
            no_local,
            config.batching_size,
            paused,
        );
        let consumer = Arc::new(Self {
            session: Arc::downgrade(session),
            destination,
            unique_tag,
            queue_name,
            durable,
            no_local,
            auto_ack: session.ack_mode().auto_acknowledges(),
            channel,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
            listener_consumer: Mutex::new(None),
            buffer: buffer.clone(),
            gate: ReceiveGate::new(!paused),
            abortables: AbortableSet::new(),
            stop_timeout: config.stop_timeout,
            termination_timeout: config.termination_timeout,
        });
        consumer.abortables.add(buffer);
        consumer
    }

    /// Block until a message arrives, the consumer is closed, or the calling
    /// future is cancelled. Returns `None` only on close.
    pub async fn receive(&self) -> Result<Option<Message>> {
        self.receive_internal(TimeTracker::Infinite).await
    }

    /// Block for up to `timeout_millis`. Zero means wait without bound, per
    /// the messaging-standard convention. Returns `None` on timeout or when
    /// the wait ends due to a stop or close.
    pub async fn receive_timeout(&self, timeout_millis: u64) -> Result<Option<Message>> {
        let deadline = if timeout_millis == 0 {
            TimeTracker::Infinite
        } else {
            TimeTracker::after(Duration::from_millis(timeout_millis))
        };
        self.receive_internal(deadline).await
    }

    /// Return a message only if one is immediately available, either
    /// buffered or via a single non-blocking broker fetch.
    pub async fn receive_no_wait(&self) -> Result<Option<Message>> {
        self.check_open()?;
        let fetched = self.buffer.get(TimeTracker::Zero).await?;
        self.settle(fetched).await
    }

    async fn receive_internal(&self, deadline: TimeTracker) -> Result<Option<Message>> {
        self.check_open()?;
        let guard = match self.gate.enter(deadline).await {
            Entered::Admitted(guard) => guard,
            Entered::TimedOut | Entered::Aborted => return Ok(None),
        };
        let fetched = self.buffer.get(deadline).await?;
        // A stop must not keep us from settling a message we already hold.
        let delivered = self.settle(fetched).await;
        drop(guard);
        delivered
    }

    // Decode and settle one fetched response: auto-ack modes acknowledge
    // right here, the others register the tag with the session.
    async fn settle(&self, fetched: Fetched) -> Result<Option<Message>> {
        let response = match fetched {
            Fetched::Delivery(response) => response,
            Fetched::Empty | Fetched::Aborted => return Ok(None),
        };
        let delivery_tag = response.envelope.delivery_tag;
        let message = self.message_from(response)?;
        if self.auto_ack {
            self.channel.basic_ack(delivery_tag).await?;
        } else {
            self.register_unacked(delivery_tag);
        }
        Ok(Some(message))
    }

    /// Atomically replace the push listener. `None` clears it. Installing
    /// the currently installed listener again is a no-op; losing an install
    /// race fails with `IllegalState`.
    pub async fn set_message_listener(
        self: &Arc<Self>,
        listener: Option<Arc<dyn MessageListener>>,
    ) -> Result<()> {
        {
            let current = self.listener.lock().expect("listener slot lock");
            let unchanged = match (&*current, &listener) {
                (Some(current), Some(new)) => Arc::ptr_eq(current, new),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return Ok(());
            }
        }
        self.remove_listener_consumer().await;
        *self.listener.lock().expect("listener slot lock") = listener.clone();
        let Some(listener) = listener else {
            return Ok(());
        };
        let session = self.session()?;
        let connection = session.connection()?;
        let listener_consumer = ListenerConsumer::new(self, listener, self.termination_timeout);
        let installed = {
            let mut slot = self.listener_consumer.lock().expect("listener consumer lock");
            if slot.is_none() {
                *slot = Some(listener_consumer.clone());
                true
            } else {
                false
            }
        };
        if installed {
            self.abortables.add(listener_consumer.clone());
            if !connection.is_stopped() {
                listener_consumer.start().await;
            }
            Ok(())
        } else {
            // The loser must tear down what it built so no subscription
            // leaks.
            listener_consumer.abort().await;
            Err(Error::IllegalState("message listener concurrently replaced"))
        }
    }

    pub fn message_listener(&self) -> Option<Arc<dyn MessageListener>> {
        self.listener.lock().expect("listener slot lock").clone()
    }

    // Uninstall the current listener subscription: orderly stop first, then
    // force whatever is left.
    async fn remove_listener_consumer(&self) {
        let current = self
            .listener_consumer
            .lock()
            .expect("listener consumer lock")
            .take();
        if let Some(listener_consumer) = current {
            let handle: Arc<dyn Abortable> = listener_consumer.clone();
            self.abortables.remove(&handle);
            listener_consumer.stop().await;
            listener_consumer.abort().await;
        }
    }

    /// Close via the owning session, which drops its registry entry and
    /// finishes with [`Consumer::internal_close`].
    pub async fn close(&self) -> Result<()> {
        match self.session.upgrade() {
            Some(session) => session.consumer_close(self).await,
            None => {
                self.internal_close().await;
                Ok(())
            }
        }
    }

    /// True once `close` has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing_or_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire)
    }

    pub(crate) async fn internal_close(&self) {
        if self.closed.load(Ordering::Acquire) || self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(consumer = %self.unique_tag, "closing consumer");
        // Disable the gate and turn away anyone parked at it.
        self.gate.close_gate();
        self.gate.abort_waiters();
        *self.listener.lock().expect("listener slot lock") = None;
        self.remove_listener_consumer().await;
        self.abortables.abort().await;
        // Let woken receivers finish settling before the session takes the
        // channel down underneath them.
        if !self
            .gate
            .wait_to_clear(TimeTracker::after(self.stop_timeout))
            .await
        {
            warn!(consumer = %self.unique_tag, "receives still in flight at close");
        }
        self.closed.store(true, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }

    /// Quiesce for a connection stop: close the gate, give in-flight
    /// receives the stop timeout to drain, then stop the subscriptions.
    pub(crate) async fn pause(&self) {
        self.gate.close_gate();
        if !self
            .gate
            .wait_to_clear(TimeTracker::after(self.stop_timeout))
            .await
        {
            warn!(consumer = %self.unique_tag, "receives still in flight at stop timeout");
        }
        self.abortables.stop().await;
    }

    /// Undo a `pause` for a connection start: resubscribe, then reopen the
    /// gate.
    pub(crate) async fn resume(&self) {
        self.abortables.start().await;
        self.gate.open_gate();
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn no_local(&self) -> bool {
        self.no_local
    }

    pub(crate) fn session(&self) -> Result<Arc<Session>> {
        self.session
            .upgrade()
            .ok_or(Error::IllegalState("session no longer exists"))
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub(crate) fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub(crate) fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }

    pub(crate) fn register_unacked(&self, delivery_tag: u64) {
        if let Some(session) = self.session.upgrade() {
            session.unacked_message_received(delivery_tag);
        }
    }

    pub(crate) fn message_from(&self, response: GetResponse) -> Result<Message> {
        Ok(Message::from_delivery(
            response,
            self.destination.clone(),
            self.session.clone(),
        )?)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closing_or_closed() {
            return Err(Error::IllegalState("consumer is closed or closing"));
        }
        Ok(())
    }
}
