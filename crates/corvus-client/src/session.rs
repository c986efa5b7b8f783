// Session: one broker channel, one acknowledgement mode, and the owning
// registry for consumers. Consumers point back here with a weak reference;
// closing a consumer routes through the session so the registry stays
// consistent.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use corvus_broker::Channel;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::consumer::{new_consumer_tag, Consumer};
use crate::destination::Destination;
use crate::{Error, Result};

/// How deliveries get settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged by the client core right after delivery.
    Auto,
    /// Same as `Auto` at this layer; duplicates are tolerated upstream.
    DupsOk,
    /// The application acknowledges via [`crate::Message::acknowledge`].
    Client,
    /// Settled when the session commits.
    Transacted,
}

impl AckMode {
    pub fn auto_acknowledges(&self) -> bool {
        matches!(self, AckMode::Auto | AckMode::DupsOk)
    }
}

pub struct Session {
    connection: Weak<Connection>,
    channel: Arc<dyn Channel>,
    ack_mode: AckMode,
    config: ClientConfig,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    // Delivery tags handed to the application but not yet settled.
    unacked: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        connection: Weak<Connection>,
        channel: Arc<dyn Channel>,
        ack_mode: AckMode,
        config: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            channel,
            ack_mode,
            config,
            consumers: Mutex::new(Vec::new()),
            unacked: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Create a consumer on a queue or topic. Topic consumers get a private
    /// queue named by their unique tag, bound to the topic's exchange.
    pub async fn create_consumer(self: &Arc<Self>, destination: &Destination) -> Result<Arc<Consumer>> {
        self.build_consumer(destination, false, false, None).await
    }

    /// Topic consumer that skips messages published on this connection.
    pub async fn create_consumer_no_local(
        self: &Arc<Self>,
        destination: &Destination,
    ) -> Result<Arc<Consumer>> {
        self.build_consumer(destination, false, true, None).await
    }

    /// Durable topic subscription: the private queue takes the subscription
    /// name and outlives the consumer.
    pub async fn create_durable_consumer(
        self: &Arc<Self>,
        topic: &Destination,
        subscription_name: &str,
    ) -> Result<Arc<Consumer>> {
        if topic.is_queue() {
            return Err(Error::IllegalState(
                "durable subscriptions apply to topics only",
            ));
        }
        self.build_consumer(topic, true, false, Some(subscription_name))
            .await
    }

    async fn build_consumer(
        self: &Arc<Self>,
        destination: &Destination,
        durable: bool,
        no_local: bool,
        subscription_name: Option<&str>,
    ) -> Result<Arc<Consumer>> {
        if self.is_closed() {
            return Err(Error::IllegalState("session is closed"));
        }
        let connection = self.connection()?;
        let unique_tag = subscription_name
            .map(str::to_string)
            .unwrap_or_else(new_consumer_tag);
        if destination.is_queue() {
            self.channel
                .queue_declare(destination.physical_name(), true)
                .await?;
        } else {
            self.channel
                .exchange_declare(destination.physical_name())
                .await?;
            self.channel.queue_declare(&unique_tag, durable).await?;
            self.channel
                .queue_bind(&unique_tag, destination.physical_name())
                .await?;
        }
        let consumer = Consumer::new(
            self,
            destination.clone(),
            unique_tag,
            connection.is_stopped(),
            durable,
            no_local,
        );
        self.consumers
            .lock()
            .expect("consumer registry lock")
            .push(consumer.clone());
        debug!(destination = %destination, "consumer created");
        Ok(consumer)
    }

    // A consumer handed an unsettled delivery to the application; remember
    // the tag until an acknowledge, recover, or commit.
    pub(crate) fn unacked_message_received(&self, delivery_tag: u64) {
        self.unacked.lock().expect("unacked lock").push(delivery_tag);
    }

    /// Acknowledge every unsettled delivery on this session.
    pub async fn acknowledge(&self) -> Result<()> {
        let tags = self.drain_unacked();
        for delivery_tag in tags {
            self.channel.basic_ack(delivery_tag).await?;
        }
        Ok(())
    }

    /// Hand every unsettled delivery back to the broker for redelivery.
    pub async fn recover(&self) -> Result<()> {
        let tags = self.drain_unacked();
        for delivery_tag in tags {
            self.channel.basic_nack(delivery_tag, true).await?;
        }
        Ok(())
    }

    /// Transacted sessions settle their deliveries on commit.
    pub async fn commit(&self) -> Result<()> {
        if self.ack_mode != AckMode::Transacted {
            return Err(Error::IllegalState("session is not transacted"));
        }
        self.acknowledge().await
    }

    /// Transacted sessions return their deliveries on rollback.
    pub async fn rollback(&self) -> Result<()> {
        if self.ack_mode != AckMode::Transacted {
            return Err(Error::IllegalState("session is not transacted"));
        }
        self.recover().await
    }

    fn drain_unacked(&self) -> Vec<u64> {
        let mut unacked = self.unacked.lock().expect("unacked lock");
        unacked.drain(..).collect()
    }

    // Close one consumer: drop the registry entry first, then run its close
    // protocol.
    pub(crate) async fn consumer_close(&self, consumer: &Consumer) -> Result<()> {
        self.consumers
            .lock()
            .expect("consumer registry lock")
            .retain(|entry| !std::ptr::eq(entry.as_ref(), consumer));
        consumer.internal_close().await;
        Ok(())
    }

    /// Close every consumer, then the channel. Idempotent; teardown errors
    /// are logged and never leave the session half-open.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let consumers = self.snapshot_and_clear();
        for consumer in consumers {
            consumer.internal_close().await;
        }
        if let Err(err) = self.channel.close().await {
            warn!(error = %err, "channel close failed");
        }
        Ok(())
    }

    pub(crate) async fn pause_all(&self) {
        for consumer in self.snapshot() {
            consumer.pause().await;
        }
    }

    pub(crate) async fn resume_all(&self) {
        for consumer in self.snapshot() {
            consumer.resume().await;
        }
    }

    fn snapshot(&self) -> Vec<Arc<Consumer>> {
        self.consumers.lock().expect("consumer registry lock").clone()
    }

    fn snapshot_and_clear(&self) -> Vec<Arc<Consumer>> {
        let mut consumers = self.consumers.lock().expect("consumer registry lock");
        consumers.drain(..).collect()
    }

    pub(crate) fn connection(&self) -> Result<Arc<Connection>> {
        self.connection
            .upgrade()
            .ok_or(Error::IllegalState("connection no longer exists"))
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }
}
