// In-process AMQP-style broker.
// Queues keep a strict-FIFO ready list; exchanges fan out to bound queues.
// Delivery tags are allocated per channel and unacked deliveries are tracked
// there so a nack or a channel close can put messages back in place.
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("consumer tag in use: {0}")]
    ConsumerTagInUse(String),
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
    #[error("access refused: queue {0} is held by an exclusive consumer")]
    AccessRefused(String),
}

/// Broker-assigned delivery metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Pass-through message properties, carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// A single fetched or pushed delivery.
#[derive(Debug, Clone)]
pub struct GetResponse {
    pub envelope: Envelope,
    pub properties: Properties,
    pub body: Bytes,
}

/// Push-subscription callback surface.
///
/// `on_delivery` calls for one subscription are strictly sequential: the
/// broker drives each subscription from a single dispatch task.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_delivery(
        &self,
        consumer_tag: &str,
        envelope: Envelope,
        properties: Properties,
        body: Bytes,
    );

    /// Broker-initiated cancel (e.g. the queue went away).
    async fn on_cancel(&self, _consumer_tag: &str) {}

    /// Reply to a `basic_cancel`, delivered after any in-flight deliveries.
    async fn on_cancel_ok(&self, _consumer_tag: &str) {}

    /// The owning channel or connection is going down.
    async fn on_shutdown(&self, _reason: &str) {}
}

/// Channel capability used by the client. Implementations must be safe to
/// call from callback context (no reentrant locks held across calls).
#[async_trait]
pub trait Channel: Send + Sync {
    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<GetResponse>>;

    #[allow(clippy::too_many_arguments)]
    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer_tag: &str,
        no_local: bool,
        exclusive: bool,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<String>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    /// `exchange == ""` publishes straight to the queue named by
    /// `routing_key`; a named exchange fans out to every bound queue.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> Result<()>;

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<()>;
    async fn exchange_declare(&self, exchange: &str) -> Result<()>;
    async fn queue_bind(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Closing a channel requeues everything it left unacked.
    async fn close(&self) -> Result<()>;
}

/// An open broker connection that can mint channels.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    // Position in the queue's publish order; requeues reinsert by this.
    seq: u64,
    properties: Properties,
    body: Bytes,
    redelivered: bool,
    publisher_connection: u64,
}

enum DispatchItem {
    Delivery {
        consumer_tag: String,
        envelope: Envelope,
        properties: Properties,
        body: Bytes,
    },
    CancelOk {
        consumer_tag: String,
    },
    Shutdown {
        reason: String,
    },
}

struct SubscriptionEntry {
    tag: String,
    channel_id: u64,
    connection_id: u64,
    no_local: bool,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<DispatchItem>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    subscriptions: Vec<SubscriptionEntry>,
    // True while an exclusive consumer holds the queue.
    exclusive_consumer: bool,
    durable: bool,
    next_seq: u64,
    rr_cursor: usize,
}

impl QueueState {
    // Reinsert keeping publish order: requeued messages land ahead of
    // anything published after them.
    fn reinsert(&mut self, message: QueuedMessage) {
        let position = self
            .ready
            .iter()
            .position(|queued| queued.seq > message.seq)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, message);
    }
}

struct UnackedEntry {
    queue: String,
    message: QueuedMessage,
}

struct ChannelState {
    next_delivery_tag: u64,
    unacked: HashMap<u64, UnackedEntry>,
    // (consumer tag, queue) pairs registered on this channel.
    consumer_tags: Vec<(String, String)>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    // Exchange name -> bound queue names.
    exchanges: HashMap<String, Vec<String>>,
    channels: HashMap<u64, ChannelState>,
}

/// In-process broker. Cheap to construct; all state lives behind one mutex
/// with short critical sections, and per-subscription dispatch tasks invoke
/// callbacks outside of it.
#[derive(Default)]
pub struct Broker {
    state: Mutex<BrokerState>,
    next_connection_id: AtomicU64,
    next_channel_id: AtomicU64,
}

impl Broker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a logical connection. Channels opened from it share the
    /// connection identity used for `no_local` filtering.
    pub fn connect(self: &Arc<Self>) -> Arc<InProcessConnection> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(InProcessConnection {
            broker: self.clone(),
            connection_id,
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of undelivered messages sitting ready in a queue.
    pub fn ready_len(&self, queue: &str) -> usize {
        let state = self.state.lock().expect("broker lock");
        state
            .queues
            .get(queue)
            .map(|queue| queue.ready.len())
            .unwrap_or(0)
    }

    /// Unacked deliveries outstanding across every channel.
    pub fn unacked_total(&self) -> usize {
        let state = self.state.lock().expect("broker lock");
        state
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }
}

// Hand ready messages to subscriptions until the queue drains or nobody is
// eligible. Must be called with the state lock held.
fn dispatch_queue(state: &mut BrokerState, queue_name: &str) {
    let BrokerState {
        queues, channels, ..
    } = state;
    let Some(queue) = queues.get_mut(queue_name) else {
        return;
    };
    loop {
        queue.subscriptions.retain(|sub| !sub.tx.is_closed());
        if queue.subscriptions.is_empty() {
            return;
        }
        let Some(front) = queue.ready.front() else {
            return;
        };
        let count = queue.subscriptions.len();
        let mut chosen = None;
        for offset in 0..count {
            let index = (queue.rr_cursor + offset) % count;
            let sub = &queue.subscriptions[index];
            if sub.no_local && front.publisher_connection == sub.connection_id {
                continue;
            }
            chosen = Some(index);
            break;
        }
        let Some(index) = chosen else {
            // Head message is local to every subscriber; leave it for
            // basic_get or a later consumer.
            return;
        };
        queue.rr_cursor = (index + 1) % count;
        let message = queue.ready.pop_front().expect("ready front");
        let sub = &queue.subscriptions[index];
        let Some(channel) = channels.get_mut(&sub.channel_id) else {
            queue.reinsert(message);
            return;
        };
        let delivery_tag = channel.next_delivery_tag;
        channel.next_delivery_tag += 1;
        let envelope = Envelope {
            delivery_tag,
            redelivered: message.redelivered,
        };
        if !sub.auto_ack {
            channel.unacked.insert(
                delivery_tag,
                UnackedEntry {
                    queue: queue_name.to_string(),
                    message: message.clone(),
                },
            );
        }
        let item = DispatchItem::Delivery {
            consumer_tag: sub.tag.clone(),
            envelope,
            properties: message.properties.clone(),
            body: message.body.clone(),
        };
        if sub.tx.send(item).is_err() {
            channel.unacked.remove(&delivery_tag);
            queue.reinsert(message);
            continue;
        }
    }
}

// Tear down one channel: shut its subscriptions down and requeue whatever it
// left unacked, preserving original queue positions.
fn close_channel(state: &mut BrokerState, channel_id: u64, reason: &str) {
    let Some(mut channel) = state.channels.remove(&channel_id) else {
        return;
    };
    for (tag, queue_name) in channel.consumer_tags.drain(..) {
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            if let Some(index) = queue.subscriptions.iter().position(|sub| sub.tag == tag) {
                let sub = queue.subscriptions.remove(index);
                queue.exclusive_consumer = false;
                let _ = sub.tx.send(DispatchItem::Shutdown {
                    reason: reason.to_string(),
                });
            }
        }
    }
    let mut entries: Vec<UnackedEntry> = channel.unacked.drain().map(|(_, entry)| entry).collect();
    entries.sort_by_key(|entry| entry.message.seq);
    let mut touched = Vec::new();
    for entry in entries {
        if let Some(queue) = state.queues.get_mut(&entry.queue) {
            let mut message = entry.message;
            message.redelivered = true;
            queue.reinsert(message);
            if !touched.contains(&entry.queue) {
                touched.push(entry.queue);
            }
        }
    }
    for queue_name in touched {
        dispatch_queue(state, &queue_name);
    }
}

async fn run_dispatch(callback: Arc<dyn DeliveryCallback>, mut rx: mpsc::UnboundedReceiver<DispatchItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            DispatchItem::Delivery {
                consumer_tag,
                envelope,
                properties,
                body,
            } => {
                callback.on_delivery(&consumer_tag, envelope, properties, body).await;
            }
            DispatchItem::CancelOk { consumer_tag } => {
                callback.on_cancel_ok(&consumer_tag).await;
                break;
            }
            DispatchItem::Shutdown { reason } => {
                callback.on_shutdown(&reason).await;
                break;
            }
        }
    }
}

/// Connection handle returned by [`Broker::connect`].
pub struct InProcessConnection {
    broker: Arc<Broker>,
    connection_id: u64,
    channels: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerLink for InProcessConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ChannelClosed);
        }
        let channel_id = self.broker.next_channel_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.broker.state.lock().expect("broker lock");
            state.channels.insert(
                channel_id,
                ChannelState {
                    next_delivery_tag: 1,
                    unacked: HashMap::new(),
                    consumer_tags: Vec::new(),
                },
            );
        }
        self.channels.lock().expect("channel list lock").push(channel_id);
        Ok(Arc::new(InProcessChannel {
            broker: self.broker.clone(),
            channel_id,
            connection_id: self.connection_id,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels: Vec<u64> = self.channels.lock().expect("channel list lock").drain(..).collect();
        let mut state = self.broker.state.lock().expect("broker lock");
        for channel_id in channels {
            close_channel(&mut state, channel_id, "connection closed");
        }
        Ok(())
    }
}

/// One broker channel. All operations take the broker lock briefly and never
/// block; push deliveries happen on detached dispatch tasks.
pub struct InProcessChannel {
    broker: Arc<Broker>,
    channel_id: u64,
    connection_id: u64,
}

impl InProcessChannel {
    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> Result<T>) -> Result<T> {
        let mut state = self.broker.state.lock().expect("broker lock");
        if !state.channels.contains_key(&self.channel_id) {
            return Err(BrokerError::ChannelClosed);
        }
        f(&mut state)
    }
}

#[async_trait]
impl Channel for InProcessChannel {
    async fn basic_get(&self, queue: &str, auto_ack: bool) -> Result<Option<GetResponse>> {
        self.with_state(|state| {
            let response = {
                let BrokerState {
                    queues, channels, ..
                } = state;
                let queue_state = queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
                let Some(message) = queue_state.ready.pop_front() else {
                    return Ok(None);
                };
                let channel = channels
                    .get_mut(&self.channel_id)
                    .ok_or(BrokerError::ChannelClosed)?;
                let delivery_tag = channel.next_delivery_tag;
                channel.next_delivery_tag += 1;
                let envelope = Envelope {
                    delivery_tag,
                    redelivered: message.redelivered,
                };
                let response = GetResponse {
                    envelope,
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                };
                if !auto_ack {
                    channel.unacked.insert(
                        delivery_tag,
                        UnackedEntry {
                            queue: queue.to_string(),
                            message,
                        },
                    );
                }
                response
            };
            // The head changed; a subscription skipped for no_local may now
            // be eligible for the next message.
            dispatch_queue(state, queue);
            Ok(Some(response))
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        auto_ack: bool,
        consumer_tag: &str,
        no_local: bool,
        exclusive: bool,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<String> {
        self.with_state(|state| {
            let tag_in_use = state
                .queues
                .values()
                .any(|q| q.subscriptions.iter().any(|sub| sub.tag == consumer_tag));
            if tag_in_use {
                return Err(BrokerError::ConsumerTagInUse(consumer_tag.to_string()));
            }
            let queue_state = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if queue_state.exclusive_consumer
                || (exclusive && !queue_state.subscriptions.is_empty())
            {
                return Err(BrokerError::AccessRefused(queue.to_string()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatch(callback, rx));
            queue_state.subscriptions.push(SubscriptionEntry {
                tag: consumer_tag.to_string(),
                channel_id: self.channel_id,
                connection_id: self.connection_id,
                no_local,
                auto_ack,
                tx,
            });
            if exclusive {
                queue_state.exclusive_consumer = true;
            }
            state
                .channels
                .get_mut(&self.channel_id)
                .ok_or(BrokerError::ChannelClosed)?
                .consumer_tags
                .push((consumer_tag.to_string(), queue.to_string()));
            debug!(consumer_tag, queue, "subscription registered");
            dispatch_queue(state, queue);
            Ok(consumer_tag.to_string())
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.with_state(|state| {
            let channel = state
                .channels
                .get_mut(&self.channel_id)
                .ok_or(BrokerError::ChannelClosed)?;
            channel
                .unacked
                .remove(&delivery_tag)
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
            Ok(())
        })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.with_state(|state| {
            let entry = state
                .channels
                .get_mut(&self.channel_id)
                .ok_or(BrokerError::ChannelClosed)?
                .unacked
                .remove(&delivery_tag)
                .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
            if requeue {
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.reinsert(message);
                }
                dispatch_queue(state, &entry.queue);
            }
            Ok(())
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.with_state(|state| {
            let channel = state
                .channels
                .get_mut(&self.channel_id)
                .ok_or(BrokerError::ChannelClosed)?;
            let Some(position) = channel
                .consumer_tags
                .iter()
                .position(|(tag, _)| tag == consumer_tag)
            else {
                // Cancel of an unknown tag is not an error; the consumer may
                // have gone away with its channel already.
                debug!(consumer_tag, "cancel for unknown consumer tag");
                return Ok(());
            };
            let (tag, queue_name) = channel.consumer_tags.remove(position);
            if let Some(queue) = state.queues.get_mut(&queue_name) {
                if let Some(index) = queue.subscriptions.iter().position(|sub| sub.tag == tag) {
                    let sub = queue.subscriptions.remove(index);
                    queue.exclusive_consumer = false;
                    let _ = sub.tx.send(DispatchItem::CancelOk { consumer_tag: tag });
                }
            }
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Bytes,
    ) -> Result<()> {
        self.with_state(|state| {
            let targets: Vec<String> = if exchange.is_empty() {
                if !state.queues.contains_key(routing_key) {
                    return Err(BrokerError::QueueNotFound(routing_key.to_string()));
                }
                vec![routing_key.to_string()]
            } else {
                state
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?
                    .clone()
            };
            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    let seq = queue.next_seq;
                    queue.next_seq += 1;
                    queue.ready.push_back(QueuedMessage {
                        seq,
                        properties: properties.clone(),
                        body: body.clone(),
                        redelivered: false,
                        publisher_connection: self.connection_id,
                    });
                }
                dispatch_queue(state, &target);
            }
            Ok(())
        })
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<()> {
        self.with_state(|state| {
            state.queues.entry(queue.to_string()).or_insert_with(|| QueueState {
                durable,
                ..QueueState::default()
            });
            Ok(())
        })
    }

    async fn exchange_declare(&self, exchange: &str) -> Result<()> {
        self.with_state(|state| {
            state.exchanges.entry(exchange.to_string()).or_default();
            Ok(())
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str) -> Result<()> {
        self.with_state(|state| {
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            let bindings = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            if !bindings.iter().any(|bound| bound == queue) {
                bindings.push(queue.to_string());
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.state.lock().expect("broker lock");
        close_channel(&mut state, self.channel_id, "channel closed");
        Ok(())
    }
}
