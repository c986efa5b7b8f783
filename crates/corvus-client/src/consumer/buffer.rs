// Batched synchronous fetch. The broker only pushes; this buffer bridges to
// pull semantics by keeping one bounded pre-fetching subscription alive and
// handing its deliveries out one receive at a time.
use async_trait::async_trait;
use bytes::Bytes;
use corvus_broker::{Channel, DeliveryCallback, Envelope, GetResponse, Properties};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::consumer::abortable::Abortable;
use crate::consumer::new_consumer_tag;
use crate::consumer::time::TimeTracker;

/// Outcome of a buffer fetch.
pub(crate) enum Fetched {
    Delivery(GetResponse),
    /// Nothing arrived inside the budget, or the buffer is stopped.
    Empty,
    /// The buffer was torn down while waiting.
    Aborted,
}

enum SubscriptionSlot {
    Idle,
    // Tag reserved; basic_consume is in flight. Deliveries may already race
    // in before the registration call returns.
    Starting(String),
    Live(String),
}

struct BufferInner {
    fifo: VecDeque<GetResponse>,
    subscription: SubscriptionSlot,
    // Connection stop: in-flight waits end empty, the fifo survives.
    stopped: bool,
    // Consumer close: waits end aborted, the fifo is requeued.
    aborted: bool,
}

pub(crate) struct ReceiveBuffer {
    channel: Arc<dyn Channel>,
    queue_name: String,
    no_local: bool,
    batching_size: usize,
    inner: Mutex<BufferInner>,
    // Wakes waiters on enqueue, stop, and abort.
    available: Notify,
}

impl ReceiveBuffer {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        queue_name: String,
        no_local: bool,
        batching_size: usize,
        paused: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            queue_name,
            no_local,
            batching_size: batching_size.max(1),
            inner: Mutex::new(BufferInner {
                fifo: VecDeque::new(),
                subscription: SubscriptionSlot::Idle,
                stopped: paused,
                aborted: false,
            }),
            available: Notify::new(),
        })
    }

    /// Hand out one delivery within the budget. A zero budget never starts a
    /// subscription; it probes the broker once instead.
    pub(crate) async fn get(self: &Arc<Self>, deadline: TimeTracker) -> crate::Result<Fetched> {
        loop {
            // Register interest before checking so an enqueue between the
            // check and the wait still wakes us.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("buffer lock");
                if inner.aborted {
                    return Ok(Fetched::Aborted);
                }
                if let Some(response) = inner.fifo.pop_front() {
                    return Ok(Fetched::Delivery(response));
                }
                if inner.stopped && deadline != TimeTracker::Zero {
                    return Ok(Fetched::Empty);
                }
            }
            if deadline == TimeTracker::Zero {
                let response = self.channel.basic_get(&self.queue_name, false).await?;
                return Ok(match response {
                    Some(response) => Fetched::Delivery(response),
                    None => Fetched::Empty,
                });
            }
            self.ensure_subscription().await?;
            match deadline.remaining() {
                None => notified.await,
                Some(budget) if budget.is_zero() => return Ok(Fetched::Empty),
                Some(budget) => {
                    if timeout(budget, notified).await.is_err() {
                        return Ok(Fetched::Empty);
                    }
                }
            }
        }
    }

    // Start the pre-fetching subscription unless one is already in flight.
    async fn ensure_subscription(self: &Arc<Self>) -> crate::Result<()> {
        let tag = new_consumer_tag();
        {
            let mut inner = self.inner.lock().expect("buffer lock");
            if inner.aborted || inner.stopped {
                return Ok(());
            }
            match inner.subscription {
                SubscriptionSlot::Idle => {
                    inner.subscription = SubscriptionSlot::Starting(tag.clone());
                }
                SubscriptionSlot::Starting(_) | SubscriptionSlot::Live(_) => return Ok(()),
            }
        }
        let callback = Arc::new(OnceOnlyConsumer {
            buffer: self.clone(),
            remaining: AtomicUsize::new(self.batching_size),
        });
        let result = self
            .channel
            .basic_consume(&self.queue_name, false, &tag, self.no_local, false, callback)
            .await;
        let cancel_now = {
            let mut inner = self.inner.lock().expect("buffer lock");
            match result {
                Ok(_) => {
                    if inner.aborted || inner.stopped {
                        // Lost a race with abort/stop; the subscription must
                        // not outlive it.
                        inner.subscription = SubscriptionSlot::Idle;
                        true
                    } else {
                        inner.subscription = SubscriptionSlot::Live(tag.clone());
                        false
                    }
                }
                Err(err) => {
                    inner.subscription = SubscriptionSlot::Idle;
                    return Err(err.into());
                }
            }
        };
        if cancel_now {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                debug!(error = %err, consumer_tag = %tag, "cancel of raced subscription failed");
            }
        }
        Ok(())
    }

    fn clear_subscription(&self, consumer_tag: &str) {
        let cleared = {
            let mut inner = self.inner.lock().expect("buffer lock");
            let ours = match &inner.subscription {
                SubscriptionSlot::Starting(tag) | SubscriptionSlot::Live(tag) => {
                    tag == consumer_tag
                }
                SubscriptionSlot::Idle => false,
            };
            if ours {
                inner.subscription = SubscriptionSlot::Idle;
            }
            ours
        };
        if cleared {
            // Wake waiters so one of them starts the next subscription.
            self.available.notify_waiters();
        }
    }
}

#[async_trait]
impl Abortable for ReceiveBuffer {
    async fn start(&self) {
        // The subscription itself restarts lazily on the next get.
        self.inner.lock().expect("buffer lock").stopped = false;
    }

    async fn stop(&self) {
        let tag = {
            let mut inner = self.inner.lock().expect("buffer lock");
            inner.stopped = true;
            if let SubscriptionSlot::Live(tag) = &inner.subscription {
                let tag = tag.clone();
                inner.subscription = SubscriptionSlot::Idle;
                Some(tag)
            } else {
                None
            }
        };
        // In-flight waits end empty; buffered responses stay for after the
        // next start.
        self.available.notify_waiters();
        if let Some(tag) = tag {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                debug!(error = %err, consumer_tag = %tag, "cancel on stop failed");
            }
        }
    }

    async fn abort(&self) {
        let (tag, discarded) = {
            let mut inner = self.inner.lock().expect("buffer lock");
            inner.aborted = true;
            let tag = match std::mem::replace(&mut inner.subscription, SubscriptionSlot::Idle) {
                SubscriptionSlot::Live(tag) => Some(tag),
                // A Starting subscription is cancelled by its starter once
                // basic_consume returns and sees the abort.
                SubscriptionSlot::Starting(_) | SubscriptionSlot::Idle => None,
            };
            let discarded: Vec<GetResponse> = inner.fifo.drain(..).collect();
            (tag, discarded)
        };
        self.available.notify_waiters();
        if let Some(tag) = tag {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                debug!(error = %err, consumer_tag = %tag, "cancel on abort failed");
            }
        }
        for response in discarded {
            // Never handed to the application: give it back so the broker
            // redelivers instead of waiting for the channel to close.
            if let Err(err) = self
                .channel
                .basic_nack(response.envelope.delivery_tag, true)
                .await
            {
                warn!(
                    error = %err,
                    delivery_tag = response.envelope.delivery_tag,
                    "failed to requeue undelivered buffered message"
                );
            }
        }
    }
}

// Pre-fetching subscription that accepts up to `batching_size` deliveries
// and then cancels itself; the slot frees when the cancel reply lands.
struct OnceOnlyConsumer {
    buffer: Arc<ReceiveBuffer>,
    remaining: AtomicUsize,
}

#[async_trait]
impl DeliveryCallback for OnceOnlyConsumer {
    async fn on_delivery(
        &self,
        consumer_tag: &str,
        envelope: Envelope,
        properties: Properties,
        body: Bytes,
    ) {
        let mut cancel_now = false;
        let accepted = {
            let mut inner = self.buffer.inner.lock().expect("buffer lock");
            let ours = match &inner.subscription {
                SubscriptionSlot::Starting(tag) | SubscriptionSlot::Live(tag) => {
                    tag == consumer_tag
                }
                SubscriptionSlot::Idle => false,
            };
            // Deliveries for one subscription arrive sequentially, so the
            // budget needs no stronger ordering than this load/store pair.
            let budget = self.remaining.load(Ordering::Acquire);
            if inner.aborted || !ours || budget == 0 {
                false
            } else {
                self.remaining.store(budget - 1, Ordering::Release);
                inner.fifo.push_back(GetResponse {
                    envelope,
                    properties,
                    body,
                });
                cancel_now = budget == 1;
                true
            }
        };
        if accepted {
            self.buffer.available.notify_waiters();
            if cancel_now {
                if let Err(err) = self.buffer.channel.basic_cancel(consumer_tag).await {
                    debug!(error = %err, consumer_tag, "cancel of exhausted subscription failed");
                }
            }
        } else {
            // Straggler behind a cancel, or the buffer is gone: requeue.
            if let Err(err) = self
                .buffer
                .channel
                .basic_nack(envelope.delivery_tag, true)
                .await
            {
                debug!(
                    error = %err,
                    delivery_tag = envelope.delivery_tag,
                    "requeue of unwanted delivery failed"
                );
            }
        }
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        self.buffer.clear_subscription(consumer_tag);
    }

    async fn on_cancel_ok(&self, consumer_tag: &str) {
        self.buffer.clear_subscription(consumer_tag);
    }

    async fn on_shutdown(&self, _reason: &str) {
        {
            let mut inner = self.buffer.inner.lock().expect("buffer lock");
            inner.subscription = SubscriptionSlot::Idle;
        }
        self.buffer.available.notify_waiters();
    }
}
