// Push delivery path: one broker subscription bound to an application
// listener. Deliveries for a consumer are invoked one at a time; stop gives
// an in-flight invocation a bounded chance to return before cancelling.
use async_trait::async_trait;
use bytes::Bytes;
use corvus_broker::{Channel, DeliveryCallback, Envelope, GetResponse, Properties};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::consumer::abortable::Abortable;
use crate::consumer::new_consumer_tag;
use crate::consumer::time::TimeTracker;
use crate::consumer::Consumer;
use crate::message::Message;

/// Application callback for push delivery.
///
/// Invocations for one consumer never overlap. Returning an error requeues
/// the message for redelivery.
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Message) -> anyhow::Result<()>;
}

struct ListenerInner {
    // Consumer tag of the live subscription, if any.
    subscription: Option<String>,
    in_flight: bool,
    aborted: bool,
}

pub(crate) struct ListenerConsumer {
    consumer: Weak<Consumer>,
    channel: Arc<dyn Channel>,
    listener: Arc<dyn MessageListener>,
    queue_name: String,
    no_local: bool,
    termination_timeout: Duration,
    inner: Mutex<ListenerInner>,
    // Signalled when an invocation finishes or the consumer is aborted.
    idle: Notify,
    self_ref: Weak<ListenerConsumer>,
}

impl ListenerConsumer {
    pub(crate) fn new(
        consumer: &Arc<Consumer>,
        listener: Arc<dyn MessageListener>,
        termination_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            consumer: Arc::downgrade(consumer),
            channel: consumer.channel().clone(),
            listener,
            queue_name: consumer.queue_name().to_string(),
            no_local: consumer.no_local(),
            termination_timeout,
            inner: Mutex::new(ListenerInner {
                subscription: None,
                in_flight: false,
                aborted: false,
            }),
            idle: Notify::new(),
            self_ref: self_ref.clone(),
        })
    }

    async fn dispatch(
        &self,
        consumer: &Arc<Consumer>,
        envelope: Envelope,
        properties: Properties,
        body: Bytes,
    ) {
        let delivery_tag = envelope.delivery_tag;
        let response = GetResponse {
            envelope,
            properties,
            body,
        };
        let message = match consumer.message_from(response) {
            Ok(message) => message,
            Err(err) => {
                // An undecodable frame will never decode; don't requeue it.
                warn!(error = %err, delivery_tag, "dropping undecodable delivery");
                if let Err(err) = self.channel.basic_nack(delivery_tag, false).await {
                    debug!(error = %err, delivery_tag, "nack of undecodable delivery failed");
                }
                return;
            }
        };
        match self.listener.on_message(message).await {
            Ok(()) => {
                if consumer.is_auto_ack() {
                    if let Err(err) = self.channel.basic_ack(delivery_tag).await {
                        warn!(error = %err, delivery_tag, "ack after listener delivery failed");
                    }
                } else {
                    consumer.register_unacked(delivery_tag);
                }
            }
            Err(err) => {
                warn!(error = %err, delivery_tag, "listener failed; requeueing delivery");
                if let Err(err) = self.channel.basic_nack(delivery_tag, true).await {
                    warn!(error = %err, delivery_tag, "requeue after listener failure failed");
                }
            }
        }
    }

    fn finish_invocation(&self) {
        self.inner.lock().expect("listener lock").in_flight = false;
        self.idle.notify_waiters();
    }
}

#[async_trait]
impl Abortable for ListenerConsumer {
    async fn start(&self) {
        let Some(callback) = self.self_ref.upgrade() else {
            return;
        };
        let tag = new_consumer_tag();
        {
            let mut inner = self.inner.lock().expect("listener lock");
            if inner.aborted || inner.subscription.is_some() {
                return;
            }
            // Reserve the tag before subscribing: deliveries can race in
            // before basic_consume returns.
            inner.subscription = Some(tag.clone());
        }
        let callback: Arc<dyn DeliveryCallback> = callback;
        match self
            .channel
            .basic_consume(&self.queue_name, false, &tag, self.no_local, false, callback)
            .await
        {
            Ok(_) => debug!(consumer_tag = %tag, queue = %self.queue_name, "listener subscribed"),
            Err(err) => {
                warn!(error = %err, queue = %self.queue_name, "listener subscription failed");
                let mut inner = self.inner.lock().expect("listener lock");
                if inner.subscription.as_deref() == Some(tag.as_str()) {
                    inner.subscription = None;
                }
            }
        }
    }

    async fn stop(&self) {
        // Orderly: wait for an in-flight invocation, bounded by the
        // termination timeout, then cancel the subscription.
        let deadline = TimeTracker::after(self.termination_timeout);
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().expect("listener lock");
                if !inner.in_flight || inner.aborted {
                    break;
                }
            }
            match deadline.remaining() {
                None => notified.await,
                Some(budget) if budget.is_zero() => {
                    warn!(queue = %self.queue_name, "listener still running at termination timeout");
                    break;
                }
                Some(budget) => {
                    if timeout(budget, notified).await.is_err() {
                        warn!(queue = %self.queue_name, "listener still running at termination timeout");
                        break;
                    }
                }
            }
        }
        let tag = self.inner.lock().expect("listener lock").subscription.take();
        if let Some(tag) = tag {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                debug!(error = %err, consumer_tag = %tag, "listener cancel failed");
            }
        }
    }

    async fn abort(&self) {
        let tag = {
            let mut inner = self.inner.lock().expect("listener lock");
            inner.aborted = true;
            inner.subscription.take()
        };
        self.idle.notify_waiters();
        if let Some(tag) = tag {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                debug!(error = %err, consumer_tag = %tag, "listener cancel on abort failed");
            }
        }
    }
}

#[async_trait]
impl DeliveryCallback for ListenerConsumer {
    async fn on_delivery(
        &self,
        consumer_tag: &str,
        envelope: Envelope,
        properties: Properties,
        body: Bytes,
    ) {
        let accepted = {
            let mut inner = self.inner.lock().expect("listener lock");
            let ours = inner.subscription.as_deref() == Some(consumer_tag);
            if inner.aborted || !ours {
                false
            } else {
                inner.in_flight = true;
                true
            }
        };
        if accepted {
            if let Some(consumer) = self.consumer.upgrade() {
                if !consumer.is_closing_or_closed() {
                    self.dispatch(&consumer, envelope, properties, body).await;
                    self.finish_invocation();
                    return;
                }
            }
            self.finish_invocation();
        }
        // Straggler behind a cancel, an aborted listener, or a closing
        // consumer: the delivery goes back for redelivery.
        if let Err(err) = self.channel.basic_nack(envelope.delivery_tag, true).await {
            debug!(
                error = %err,
                delivery_tag = envelope.delivery_tag,
                "requeue of undeliverable push message failed"
            );
        }
    }

    async fn on_cancel(&self, consumer_tag: &str) {
        let mut inner = self.inner.lock().expect("listener lock");
        if inner.subscription.as_deref() == Some(consumer_tag) {
            inner.subscription = None;
        }
    }

    async fn on_cancel_ok(&self, consumer_tag: &str) {
        let mut inner = self.inner.lock().expect("listener lock");
        if inner.subscription.as_deref() == Some(consumer_tag) {
            inner.subscription = None;
        }
    }

    async fn on_shutdown(&self, _reason: &str) {
        self.inner.lock().expect("listener lock").subscription = None;
    }
}
