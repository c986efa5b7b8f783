// End-to-end scenarios against the in-process broker. Timing-sensitive
// cases run under a paused clock so the bounds are exact.
use super::*;
use async_trait::async_trait;
use corvus_broker::{Broker, BrokerLink, Channel, Properties};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration, Instant};

const LONG: Duration = Duration::from_secs(5);

fn connect(broker: &Arc<Broker>) -> Arc<Connection> {
    Connection::new(broker.connect(), ClientConfig::default())
}

async fn publisher_channel(broker: &Arc<Broker>) -> Arc<dyn Channel> {
    broker
        .connect()
        .open_channel()
        .await
        .expect("publisher channel")
}

async fn publish_text(channel: &Arc<dyn Channel>, queue: &str, text: &str) {
    channel
        .basic_publish("", queue, Properties::default(), Message::text(text).encode())
        .await
        .expect("publish");
}

struct RecordingListener {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MessageListener for RecordingListener {
    async fn on_message(&self, message: Message) -> anyhow::Result<()> {
        let _ = self
            .tx
            .send(message.as_text().unwrap_or_default().to_string());
        Ok(())
    }
}

#[tokio::test]
async fn receive_returns_published_message() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "hello").await;

    let message = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(message.as_text(), Some("hello"));
    assert!(!message.redelivered());
    assert_eq!(message.destination(), Some(&Destination::queue("q")));
}

#[tokio::test(start_paused = true)]
async fn receive_times_out_on_empty_queue() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");

    let started = Instant::now();
    let message = consumer.receive_timeout(500).await.expect("receive");
    assert!(message.is_none());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(750), "returned late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn session_close_unblocks_infinite_receive() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");

    let receiver = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    sleep(Duration::from_millis(1_000)).await;
    session.close().await.expect("close");

    let received = timeout(LONG, receiver)
        .await
        .expect("receive returned")
        .expect("join")
        .expect("no error");
    assert!(received.is_none());
    assert!(consumer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn stop_ends_in_flight_receive_with_null() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");

    let receiver = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    // Paused clock: the sleep only elapses once the receiver is parked.
    sleep(Duration::from_millis(10)).await;
    connection.stop().await.expect("stop");
    let received = timeout(LONG, receiver)
        .await
        .expect("receive returned")
        .expect("join")
        .expect("no error");
    assert!(received.is_none());
    // The consumer is merely paused, not closed.
    assert!(!consumer.is_closed());
}

#[tokio::test(start_paused = true)]
async fn listener_pauses_across_stop_and_resumes() {
    let broker = Broker::new();
    let connection = connect(&broker);
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .set_message_listener(Some(Arc::new(RecordingListener { tx })))
        .await
        .expect("install listener");
    connection.start().await.expect("start");

    publish_text(&publisher, "q", "m1").await;
    let first = timeout(LONG, rx.recv()).await.expect("m1 in time").expect("m1");
    assert_eq!(first, "m1");

    connection.stop().await.expect("stop");
    publish_text(&publisher, "q", "m2").await;
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "no delivery while stopped"
    );

    connection.start().await.expect("start");
    let second = timeout(LONG, rx.recv()).await.expect("m2 in time").expect("m2");
    assert_eq!(second, "m2");
}

#[tokio::test(start_paused = true)]
async fn concurrent_listener_replace_leaves_one_winner() {
    let broker = Broker::new();
    let connection = connect(&broker);
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;

    let (tx0, mut rx0) = mpsc::unbounded_channel();
    consumer
        .set_message_listener(Some(Arc::new(RecordingListener { tx: tx0 })))
        .await
        .expect("install initial listener");

    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    let first = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            consumer
                .set_message_listener(Some(Arc::new(RecordingListener { tx: tx1 })))
                .await
        })
    };
    let second = {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            consumer
                .set_message_listener(Some(Arc::new(RecordingListener { tx: tx2 })))
                .await
        })
    };
    let outcomes = [
        first.await.expect("join"),
        second.await.expect("join"),
    ];
    let failures = outcomes.iter().filter(|outcome| outcome.is_err()).count();
    assert!(failures <= 1, "at most one installer may lose the race");
    for outcome in outcomes {
        if let Err(err) = outcome {
            assert!(matches!(err, Error::IllegalState(_)));
        }
    }

    connection.start().await.expect("start");
    publish_text(&publisher, "q", "m").await;
    sleep(Duration::from_millis(200)).await;

    let mut deliveries = 0;
    for rx in [&mut rx0, &mut rx1, &mut rx2] {
        while let Ok(body) = rx.try_recv() {
            assert_eq!(body, "m");
            deliveries += 1;
        }
    }
    assert_eq!(deliveries, 1, "exactly one listener receives each message");
}

struct SlowListener {
    entered: mpsc::UnboundedSender<()>,
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl MessageListener for SlowListener {
    async fn on_message(&self, _message: Message) -> anyhow::Result<()> {
        let _ = self.entered.send(());
        sleep(Duration::from_millis(500)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn close_waits_for_in_flight_listener() {
    let broker = Broker::new();
    let connection = connect(&broker);
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;

    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    consumer
        .set_message_listener(Some(Arc::new(SlowListener {
            entered: entered_tx,
            finished: finished.clone(),
        })))
        .await
        .expect("install listener");
    connection.start().await.expect("start");

    publish_text(&publisher, "q", "slow").await;
    timeout(LONG, entered_rx.recv())
        .await
        .expect("listener entered")
        .expect("listener entered");

    let started = Instant::now();
    consumer.close().await.expect("close");
    assert!(
        finished.load(Ordering::SeqCst),
        "close returned before the in-flight listener finished"
    );
    assert!(started.elapsed() >= Duration::from_millis(400));

    publish_text(&publisher, "q", "after-close").await;
    assert!(
        timeout(Duration::from_millis(300), entered_rx.recv())
            .await
            .is_err(),
        "no delivery after close"
    );
}

#[tokio::test]
async fn receive_after_close_is_illegal_state() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    consumer.close().await.expect("close");

    assert!(matches!(
        consumer.receive_timeout(10).await,
        Err(Error::IllegalState(_))
    ));
    assert!(matches!(
        consumer.receive_no_wait().await,
        Err(Error::IllegalState(_))
    ));
}

#[tokio::test]
async fn close_is_idempotent() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    consumer.close().await.expect("first close");
    consumer.close().await.expect("second close");
    session.close().await.expect("session close");
    session.close().await.expect("session close again");
    connection.close().await.expect("connection close");
    connection.close().await.expect("connection close again");
}

#[tokio::test(start_paused = true)]
async fn stopped_connection_blocks_receive_until_start() {
    let broker = Broker::new();
    let connection = connect(&broker);
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "waiting").await;

    // Never started: the gate is closed and the receive times out at it.
    let blocked = consumer.receive_timeout(200).await.expect("receive");
    assert!(blocked.is_none());

    connection.start().await.expect("start");
    let message = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(message.as_text(), Some("waiting"));
}

#[tokio::test]
async fn auto_ack_settles_with_broker() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "once").await;

    consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(broker.unacked_total(), 0);
    assert_eq!(broker.ready_len("q"), 0);
}

#[tokio::test]
async fn client_ack_defers_until_acknowledge() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection
        .create_session(AckMode::Client)
        .await
        .expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "deferred").await;

    let message = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(broker.unacked_total(), 1);
    message.acknowledge().await.expect("acknowledge");
    assert_eq!(broker.unacked_total(), 0);
}

#[tokio::test]
async fn recover_redelivers_with_flag() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection
        .create_session(AckMode::Client)
        .await
        .expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "again").await;

    let first = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert!(!first.redelivered());
    session.recover().await.expect("recover");

    let second = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(second.as_text(), Some("again"));
    assert!(second.redelivered());
}

#[tokio::test]
async fn prefetch_preserves_order_across_batches() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;

    // More than one batching window (default 5) to force the one-shot
    // subscription to recycle mid-stream.
    for index in 0..7 {
        publish_text(&publisher, "q", &format!("m{index}")).await;
    }
    for index in 0..7 {
        let message = consumer
            .receive_timeout(1_000)
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(message.as_text(), Some(format!("m{index}").as_str()));
    }
    assert_eq!(broker.unacked_total(), 0);
}

#[tokio::test]
async fn topic_fans_out_to_each_subscriber() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let topic = Destination::topic("events");
    let left = session.create_consumer(&topic).await.expect("left");
    let right = session.create_consumer(&topic).await.expect("right");
    let publisher = publisher_channel(&broker).await;
    publisher
        .basic_publish(
            "events",
            "",
            Properties::default(),
            Message::text("fan").encode(),
        )
        .await
        .expect("publish");

    for consumer in [&left, &right] {
        let message = consumer
            .receive_timeout(1_000)
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(message.as_text(), Some("fan"));
        assert_eq!(message.destination(), Some(&topic));
    }
}

#[tokio::test]
async fn durable_consumer_keeps_its_subscription_name() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let topic = Destination::topic("alerts");
    let consumer = session
        .create_durable_consumer(&topic, "ops-alerts")
        .await
        .expect("durable consumer");
    assert!(consumer.is_durable());

    let publisher = publisher_channel(&broker).await;
    publisher
        .basic_publish(
            "alerts",
            "",
            Properties::default(),
            Message::text("page").encode(),
        )
        .await
        .expect("publish");
    // The private queue carries the subscription name.
    let message = consumer
        .receive_timeout(1_000)
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(message.as_text(), Some("page"));

    let err = session
        .create_durable_consumer(&Destination::queue("q"), "nope")
        .await
        .expect_err("queue destinations cannot be durable subscriptions");
    assert!(matches!(err, Error::IllegalState(_)));
}

#[tokio::test(start_paused = true)]
async fn reinstalling_the_same_listener_is_a_noop() {
    let broker = Broker::new();
    let connection = connect(&broker);
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    let publisher = publisher_channel(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener: Arc<dyn MessageListener> = Arc::new(RecordingListener { tx });
    consumer
        .set_message_listener(Some(listener.clone()))
        .await
        .expect("install");
    connection.start().await.expect("start");
    consumer
        .set_message_listener(Some(listener))
        .await
        .expect("reinstall");

    publish_text(&publisher, "q", "solo").await;
    let body = timeout(LONG, rx.recv()).await.expect("in time").expect("delivery");
    assert_eq!(body, "solo");
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "exactly one delivery"
    );
}

#[tokio::test]
async fn receive_no_wait_only_returns_ready_messages() {
    let broker = Broker::new();
    let connection = connect(&broker);
    connection.start().await.expect("start");
    let session = connection.create_session(AckMode::Auto).await.expect("session");
    let consumer = session
        .create_consumer(&Destination::queue("q"))
        .await
        .expect("consumer");
    assert!(consumer.receive_no_wait().await.expect("empty").is_none());

    let publisher = publisher_channel(&broker).await;
    publish_text(&publisher, "q", "ready").await;
    let message = consumer
        .receive_no_wait()
        .await
        .expect("receive")
        .expect("message");
    assert_eq!(message.as_text(), Some("ready"));
}
