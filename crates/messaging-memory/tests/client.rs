use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_messaging::broker::{BrokerError, DurableConsumer};
use relay_messaging::{
    Client, ClientOptions, ConsumeState, ConsumerConfig, Context, Error, HandlerError, Headers,
    Message, StreamConfig,
};
use relay_messaging_memory::{MemoryBroker, MemoryBrokerOptions};

async fn jetstream_client(broker: MemoryBroker) -> Client<MemoryBroker> {
    Client::new(broker, ClientOptions::default().with_jetstream())
        .await
        .unwrap()
}

async fn orders_stream(client: &Client<MemoryBroker>) {
    client
        .declare_stream(StreamConfig::new("ORDERS", ["orders.>"]))
        .await
        .unwrap();
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn recorder(
    received: &Arc<Mutex<Vec<Bytes>>>,
) -> impl Fn(Context, Message) -> futures::future::Ready<Result<(), HandlerError>>
+ Send
+ Sync
+ 'static {
    let received = Arc::clone(received);
    move |_ctx: Context, message: Message| {
        received.lock().push(message.payload().clone());
        futures::future::ready(Ok(()))
    }
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_messages_are_processed_in_order() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS").with_filters(["orders.created"]))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    client.handle("orders.created", recorder(&received)).unwrap();

    let handle = client.consume(consumer).await.unwrap();
    assert_eq!(handle.name(), "billing");
    assert_eq!(handle.state(), ConsumeState::Consuming);

    for payload in ["a", "b", "c"] {
        client
            .publish_sync(&Context::new(), "orders.created", None, payload, Headers::new())
            .await
            .unwrap();
    }

    wait_until(|| received.lock().len() == 3).await;

    assert_eq!(
        *received.lock(),
        [Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
    );
    wait_until(|| broker.acknowledged("ORDERS", "billing").len() == 3).await;
    assert_eq!(broker.acknowledged("ORDERS", "billing"), [1, 2, 3]);

    handle.stop();
    handle.wait().await;
    assert_eq!(handle.state(), ConsumeState::Stopped);
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_handler_errors_do_not_stop_the_loop() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS"))
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    client
        .handle("orders.bad", |_ctx: Context, _message: Message| async {
            Err::<(), HandlerError>("boom".into())
        })
        .unwrap();
    client.handle("orders.good", recorder(&received)).unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let handler = client.consumer_message_handler().unwrap();
    let _handle = client
        .process_stream(consumer, handler, move |consumer: &str, error: Error| {
            sink.lock().push((consumer.to_string(), error));
        })
        .await
        .unwrap();

    client
        .publish_sync(&Context::new(), "orders.bad", None, "x", Headers::new())
        .await
        .unwrap();
    client
        .publish_sync(&Context::new(), "orders.good", None, "y", Headers::new())
        .await
        .unwrap();

    wait_until(|| received.lock().len() == 1).await;

    assert_eq!(*received.lock(), [Bytes::from("y")]);

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "billing");
    assert!(matches!(
        &errors[0].1,
        Error::Handler { subject, .. } if subject == "orders.bad"
    ));

    // Both messages were acknowledged before processing.
    assert_eq!(broker.acknowledged("ORDERS", "billing"), [1, 2]);
}

#[tokio::test]
async fn test_unrouted_subjects_are_acknowledged() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS"))
        .await
        .unwrap();
    let _handle = client.consume(consumer).await.unwrap();

    client
        .publish_sync(&Context::new(), "orders.unknown", None, "x", Headers::new())
        .await
        .unwrap();

    wait_until(|| broker.acknowledged("ORDERS", "billing") == [1]).await;
}

#[tokio::test]
async fn test_publish_async_times_out_waiting_for_ack() {
    let broker = MemoryBroker::new(
        MemoryBrokerOptions::default().with_ack_delay(Duration::from_secs(5)),
    );
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let ctx = Context::new().with_timeout(Duration::from_millis(20));
    let result = client
        .publish_async(&ctx, "orders.created", None, "a", true, Headers::new())
        .await;

    let error = result.unwrap_err();
    assert!(error.is_ack_timeout());
    assert!(error.is_timeout());

    // The message may still have been stored.
    assert_eq!(broker.stored("ORDERS").len(), 1);
}

#[tokio::test]
async fn test_publish_async_without_waiting() {
    let broker = MemoryBroker::new(
        MemoryBrokerOptions::default().with_ack_delay(Duration::from_secs(5)),
    );
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let ack = client
        .publish_async(&Context::new(), "orders.created", None, "a", false, Headers::new())
        .await
        .unwrap();

    assert!(ack.is_none());
    assert_eq!(broker.stored("ORDERS").len(), 1);
}

#[tokio::test]
async fn test_publish_async_returns_ack() {
    let client = jetstream_client(MemoryBroker::default()).await;
    orders_stream(&client).await;

    let ack = client
        .publish_async(&Context::new(), "orders.created", None, "a", true, Headers::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(ack.stream, "ORDERS");
    assert_eq!(ack.sequence, 1);
}

#[tokio::test]
async fn test_publish_sync_with_cancelled_context() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let ctx = Context::new();
    ctx.cancel();

    let result = client
        .publish_sync(&ctx, "orders.created", None, "a", Headers::new())
        .await;

    assert!(result.unwrap_err().is_ack_timeout());
    assert!(broker.stored("ORDERS").is_empty());
}

#[tokio::test]
async fn test_publish_sync_times_out_waiting_for_ack() {
    let broker = MemoryBroker::new(
        MemoryBrokerOptions::default().with_ack_delay(Duration::from_secs(5)),
    );
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let ctx = Context::new().with_timeout(Duration::from_millis(20));
    let error = client
        .publish_sync(&ctx, "orders.created", None, "a", Headers::new())
        .await
        .unwrap_err();

    assert!(error.is_ack_timeout());
    assert!(!error.is_rejection());

    // The broker stored the message; only the acknowledgment was late.
    assert_eq!(broker.stored("ORDERS").len(), 1);
}

#[tokio::test]
async fn test_publish_sync_rejected_by_broker() {
    let broker = MemoryBroker::new(MemoryBrokerOptions::default().with_reject_publishes(true));
    let client = jetstream_client(broker).await;
    orders_stream(&client).await;

    let error = client
        .publish_sync(&Context::new(), "orders.created", None, "a", Headers::new())
        .await
        .unwrap_err();

    assert!(error.is_rejection());
    assert!(!error.is_ack_timeout());
}

#[tokio::test]
async fn test_publish_sync_sets_message_headers() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let headers = Headers::from([("messageID".to_string(), "order-42".to_string())]);
    client
        .publish_sync(&Context::new(), "orders.created", Some("orders.replies"), "a", headers)
        .await
        .unwrap();

    let stored = broker.stored("ORDERS");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].headers["Nats-Msg-Id"], "order-42");
    assert_eq!(stored[0].headers["Reply-To"], "orders.replies");
}

#[tokio::test]
async fn test_reused_context_publishes_distinct_messages() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let ctx = Context::new().with_message_id("req-1");
    let mut duplicates = Vec::new();
    for payload in ["a", "b", "c"] {
        let ack = client
            .publish_sync(&ctx, "orders.created", None, payload, Headers::new())
            .await
            .unwrap();
        duplicates.push(ack.duplicate);
    }
    client
        .publish_async(&ctx, "orders.created", None, "d", true, Headers::new())
        .await
        .unwrap();

    assert_eq!(duplicates, [false, false, false]);
    assert_eq!(broker.stored("ORDERS").len(), 4);
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_handler_can_forward_with_its_context() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("shipping", "ORDERS").with_filters(["orders.created"]))
        .await
        .unwrap();

    let acks = Arc::new(Mutex::new(Vec::new()));
    let forwarder = client.clone();
    let sink = Arc::clone(&acks);
    client
        .handle("orders.created", move |ctx: Context, message: Message| {
            let client = forwarder.clone();
            let acks = Arc::clone(&sink);
            async move {
                let ack = client
                    .publish_sync(
                        &ctx,
                        "orders.shipped",
                        None,
                        message.payload().clone(),
                        Headers::new(),
                    )
                    .await?;
                acks.lock().push(ack);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();
    let _handle = client.consume(consumer).await.unwrap();

    client
        .publish_sync(
            &Context::new().with_message_id("req-1"),
            "orders.created",
            None,
            "a",
            Headers::new(),
        )
        .await
        .unwrap();

    wait_until(|| acks.lock().len() == 1).await;

    assert!(!acks.lock()[0].duplicate);

    let stored = broker.stored("ORDERS");
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[1].subject, "orders.shipped");
    let forwarded = relay_messaging::Envelope::decode(&stored[1].payload).unwrap();
    assert_eq!(forwarded.payload(), &Bytes::from("a"));
    assert_ne!(stored[0].headers["Nats-Msg-Id"], stored[1].headers["Nats-Msg-Id"]);
}

#[tokio::test]
async fn test_duplicate_message_ids_are_acknowledged_once() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let headers = Headers::from([("messageID".to_string(), "order-1".to_string())]);

    let first = client
        .publish_sync(&Context::new(), "orders.created", None, "a", headers.clone())
        .await
        .unwrap();
    let second = client
        .publish_sync(&Context::new(), "orders.created", None, "a", headers)
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.sequence, second.sequence);
    assert_eq!(broker.stored("ORDERS").len(), 1);
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_stream_declaration_merges_subjects() {
    let client = jetstream_client(MemoryBroker::default()).await;

    client
        .declare_stream(StreamConfig::new("ORDERS", ["a", "b"]))
        .await
        .unwrap();
    let info = client
        .declare_stream(StreamConfig::new("ORDERS", ["a", "c"]))
        .await
        .unwrap();

    let mut subjects = info.subjects;
    subjects.sort();

    assert_eq!(info.name, "ORDERS");
    assert_eq!(subjects, ["a", "b", "c"]);
}

#[tokio::test]
async fn test_consumer_declaration_is_idempotent() {
    let client = jetstream_client(MemoryBroker::default()).await;
    orders_stream(&client).await;

    let config = ConsumerConfig::new("billing", "ORDERS").with_filters(["orders.created"]);

    let first = client.declare_consumer(config.clone()).await.unwrap();
    let second = client.declare_consumer(config).await.unwrap();

    assert_eq!(first.name(), second.name());
    assert_eq!(second.stream_name(), "ORDERS");
}

#[tokio::test]
async fn test_consumer_for_missing_stream() {
    let client = jetstream_client(MemoryBroker::default()).await;

    let result = client
        .declare_consumer(ConsumerConfig::new("billing", "MISSING"))
        .await;

    assert!(matches!(
        result,
        Err(Error::CreateConsumer(BrokerError::StreamNotFound))
    ));
}

#[tokio::test]
async fn test_active_consumers() {
    let client = jetstream_client(MemoryBroker::default()).await;
    orders_stream(&client).await;

    let billing = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS"))
        .await
        .unwrap();
    let shipping = client
        .declare_consumer(ConsumerConfig::new("shipping", "ORDERS"))
        .await
        .unwrap();

    client.register_active(billing).unwrap();
    client.register_active(shipping).unwrap();

    let names: Vec<String> = client
        .active_consumers()
        .unwrap()
        .iter()
        .map(|consumer| consumer.name().to_string())
        .collect();
    assert_eq!(names, ["billing", "shipping"]);
}

#[tokio::test]
async fn test_durable_operations_require_jetstream() {
    let client = Client::new(MemoryBroker::default(), ClientOptions::default())
        .await
        .unwrap();

    assert!(!client.is_jetstream_enabled());
    assert!(matches!(client.router(), Err(Error::JetStreamNotEnabled)));
    assert!(matches!(
        client.handle("orders.created", |_ctx: Context, _message: Message| async {
            Ok::<(), HandlerError>(())
        }),
        Err(Error::JetStreamNotEnabled)
    ));
    assert!(matches!(
        client
            .publish_sync(&Context::new(), "orders.created", None, "a", Headers::new())
            .await,
        Err(Error::JetStreamNotEnabled)
    ));
    assert!(matches!(
        client
            .publish_async(&Context::new(), "orders.created", None, "a", true, Headers::new())
            .await,
        Err(Error::JetStreamNotEnabled)
    ));
    assert!(matches!(
        client
            .declare_stream(StreamConfig::new("ORDERS", ["orders.>"]))
            .await,
        Err(Error::JetStreamNotEnabled)
    ));
    assert!(matches!(
        client.active_consumers(),
        Err(Error::JetStreamNotEnabled)
    ));
    assert!(matches!(
        client.consumer_message_handler(),
        Err(Error::JetStreamNotEnabled)
    ));

    client.jetstream().await.unwrap();
    assert!(client.is_jetstream_enabled());
    assert!(client.router().unwrap().is_empty());
}

#[tokio::test]
async fn test_core_publish_reaches_subscribers() {
    let broker = MemoryBroker::default();
    let client = Client::new(broker.clone(), ClientOptions::default())
        .await
        .unwrap();

    let mut raw = {
        use relay_messaging::Broker as _;
        broker.subscribe("events.>".to_string()).await.unwrap()
    };

    client
        .publish(
            &Context::new().with_message_id("evt-1").with_trace_id("trace-1"),
            "events.login",
            "hello",
            Headers::new(),
        )
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), futures::StreamExt::next(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let envelope = relay_messaging::Envelope::decode(&message.payload).unwrap();

    assert_eq!(message.subject, "events.login");
    assert_eq!(envelope.id(), "evt-1");
    assert_eq!(envelope.trace_id(), "trace-1");
    assert_eq!(envelope.payload(), &Bytes::from("hello"));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_request_reply() {
    let client = Client::new(MemoryBroker::default(), ClientOptions::default())
        .await
        .unwrap();

    let subscription = client
        .subscribe("svc.echo", |_ctx: Context, message: Message| async move {
            let upper = String::from_utf8_lossy(message.payload()).to_uppercase();
            Ok::<Bytes, HandlerError>(Bytes::from(upper))
        })
        .await
        .unwrap();
    assert_eq!(subscription.subject(), "svc.echo");

    let response = client
        .request(
            &Context::new().with_trace_id("trace-1"),
            "svc.echo",
            "ping",
            Headers::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(response.payload(), &Bytes::from("PING"));
    assert_eq!(response.envelope.trace_id(), "trace-1");

    subscription.unsubscribe();
}

#[tokio::test]
async fn test_request_without_responders() {
    let client = Client::new(MemoryBroker::default(), ClientOptions::default())
        .await
        .unwrap();

    let error = client
        .request(
            &Context::new(),
            "svc.nobody",
            "ping",
            Headers::new(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Request(BrokerError::NoResponders)));
    assert!(error.is_rejection());
}

#[tokio::test]
async fn test_request_times_out() {
    let broker = MemoryBroker::default();
    let client = Client::new(broker.clone(), ClientOptions::default())
        .await
        .unwrap();

    let _silent = {
        use relay_messaging::Broker as _;
        broker.subscribe("svc.slow".to_string()).await.unwrap()
    };

    let error = client
        .request(
            &Context::new(),
            "svc.slow",
            "ping",
            Headers::new(),
            Duration::from_millis(20),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, Error::RequestTimeout));
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_close_stops_consume_loops() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS"))
        .await
        .unwrap();
    let handle = client.consume(consumer).await.unwrap();

    client.close().await;

    assert!(client.is_draining());
    assert!(broker.is_closed());
    assert_eq!(handle.state(), ConsumeState::Stopped);
    handle.wait().await;

    assert!(matches!(
        client.handle("orders.created", |_ctx: Context, _message: Message| async {
            Ok::<(), HandlerError>(())
        }),
        Err(Error::Draining)
    ));

    // A second close is a no-op.
    client.close().await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_message_finish() {
    let broker = MemoryBroker::default();
    let client = jetstream_client(broker.clone()).await;
    orders_stream(&client).await;

    let consumer = client
        .declare_consumer(ConsumerConfig::new("billing", "ORDERS"))
        .await
        .unwrap();

    let (started_sender, mut started) = tokio::sync::mpsc::unbounded_channel();
    let release = Arc::new(tokio::sync::Notify::new());
    let finished = Arc::new(AtomicBool::new(false));

    let gate = Arc::clone(&release);
    let done = Arc::clone(&finished);
    client
        .handle("orders.created", move |_ctx: Context, _message: Message| {
            let started = started_sender.clone();
            let release = Arc::clone(&gate);
            let finished = Arc::clone(&done);
            async move {
                let _ = started.send(());
                release.notified().await;
                finished.store(true, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    let handle = client.consume(consumer).await.unwrap();
    assert_eq!(client.consume_loop_count(), 1);

    client
        .publish_sync(&Context::new(), "orders.created", None, "a", Headers::new())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), started.recv())
        .await
        .unwrap()
        .unwrap();

    handle.stop();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(handle.state(), ConsumeState::Consuming);
    assert!(!finished.load(Ordering::SeqCst));

    release.notify_one();
    tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .unwrap();

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(handle.state(), ConsumeState::Stopped);
    assert_eq!(client.consume_loop_count(), 0);
}
