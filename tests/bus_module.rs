// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use bus_entities::{
    connection::ConnectionRegistry,
    dispatcher::{ConsumerHandler, DispatchInfo},
    errors::{HandlerError, RpcError},
    exchange::{ExchangeDefinition, ExchangeMeta},
    memory::InMemoryBroker,
    queue::{QueueDefinition, QueueMeta, SubscriptionMeta},
    rpc::{RemoteError, RpcClientMeta, RpcQueueMeta},
    BusMessage, BusModule, BusTopology, EntityContext, Message, RpcCommand,
};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Serialize, Deserialize)]
struct GetPrice {
    sku: String,
}

impl Message for GetPrice {
    const MESSAGE_TYPE: &'static str = "GetPrice";
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Price {
    sku: String,
    cents: u32,
}

impl RpcCommand for GetPrice {
    type Response = Price;
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    id: u32,
}

impl Message for OrderPlaced {
    const MESSAGE_TYPE: &'static str = "OrderPlaced";
}

struct PriceHandler;

#[async_trait]
impl ConsumerHandler for PriceHandler {
    async fn exec(&self, _ctx: &Context, msg: &BusMessage) -> Result<Option<BusMessage>, HandlerError> {
        let request: GetPrice = msg.decode().map_err(|err| HandlerError::new(err.to_string()))?;
        if request.sku == "missing" {
            return Err(HandlerError::new("unknown sku"));
        }
        if request.sku == "slow" {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        Ok(Some(BusMessage::new(
            "Price",
            json!({"sku": request.sku, "cents": 1250}),
        )))
    }
}

#[derive(Default, Clone)]
struct Recorder {
    seen: Arc<Mutex<Vec<BusMessage>>>,
    reply: Option<&'static str>,
}

impl Recorder {
    fn replying(message_type: &'static str) -> Recorder {
        Recorder {
            reply: Some(message_type),
            ..Recorder::default()
        }
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl ConsumerHandler for Recorder {
    async fn exec(&self, _ctx: &Context, msg: &BusMessage) -> Result<Option<BusMessage>, HandlerError> {
        self.seen.lock().unwrap().push(msg.clone());
        Ok(self.reply.map(|t| BusMessage::new(t, json!({"ok": true}))))
    }
}

fn context(bus: &InMemoryBroker) -> EntityContext {
    EntityContext::new(ConnectionRegistry::new().add(Arc::new(bus.clone())))
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn pricing_server(bus: &InMemoryBroker) -> BusModule {
    let module = BusTopology::new()
        .rpc_queue(
            RpcQueueMeta::new("busA", QueueDefinition::new("pricing"))
                .command::<GetPrice>(DispatchInfo::shared(GetPrice::MESSAGE_TYPE, Arc::new(PriceHandler))),
        )
        .build(context(bus))
        .unwrap();
    module.start().await.unwrap();
    module
}

async fn pricing_client(bus: &InMemoryBroker, timeout_ms: u64) -> BusModule {
    let module = BusTopology::new()
        .rpc_client(RpcClientMeta::new("pricing", "busA", "pricing").timeout_ms(timeout_ms))
        .build(context(bus))
        .unwrap();
    module.start().await.unwrap();
    module
}

#[tokio::test]
async fn rpc_round_trip_between_two_modules() {
    let bus = InMemoryBroker::new("busA");
    let _server = pricing_server(&bus).await;
    let client = pricing_client(&bus, 1_000).await;
    let rpc = client.rpc_client("pricing").unwrap();

    let price = rpc
        .send(&GetPrice { sku: "A-1".to_owned() }, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        price,
        Price {
            sku: "A-1".to_owned(),
            cents: 1250
        }
    );
    assert_eq!(rpc.pending_count(), 0);
}

#[tokio::test]
async fn remote_failures_surface_as_exceptions() {
    let bus = InMemoryBroker::new("busA");
    let _server = pricing_server(&bus).await;
    let client = pricing_client(&bus, 1_000).await;
    let rpc = client.rpc_client("pricing").unwrap();

    let err = rpc
        .send(&GetPrice { sku: "missing".to_owned() }, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        RpcError::RemoteException { payload, .. } => {
            let remote = RemoteError::from_payload(&payload).unwrap();
            assert_eq!(remote.action_namespace, "GetPrice");
            assert!(remote.message.contains("unknown sku"));
        }
        other => panic!("expected a remote exception, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_server_times_out_and_late_reply_is_discarded() {
    let bus = InMemoryBroker::new("busA");
    let _server = pricing_server(&bus).await;
    let client = pricing_client(&bus, 50).await;
    let rpc = client.rpc_client("pricing").unwrap();

    let started = tokio::time::Instant::now();
    let err = rpc
        .send(&GetPrice { sku: "slow".to_owned() }, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(started.elapsed() <= Duration::from_millis(200));
    assert_eq!(rpc.pending_count(), 0);

    // the late reply still lands on the reply queue and is acknowledged as an orphan
    assert!(eventually(|| bus.published_to_queue(rpc.reply_queue_name()).len() == 1).await);
    assert!(eventually(|| bus.queue_depth(rpc.reply_queue_name()) == 0).await);
    assert_eq!(rpc.pending_count(), 0);
}

#[tokio::test]
async fn per_instance_subscriptions_each_receive_the_event() {
    let bus = InMemoryBroker::new("busA");
    let publisher = BusTopology::new()
        .exchange(ExchangeMeta::for_message::<OrderPlaced>(
            "busA",
            ExchangeDefinition::new("orders").fanout(),
        ))
        .build(context(&bus))
        .unwrap();
    publisher.start().await.unwrap();

    let mut instances = vec![];
    for _ in 0..2 {
        let recorder = Recorder::default();
        let module = BusTopology::new()
            .subscription(
                SubscriptionMeta::new(
                    "busA",
                    "orders",
                    QueueDefinition::new("billing").delete(),
                    DispatchInfo::shared(OrderPlaced::MESSAGE_TYPE, Arc::new(recorder.clone())),
                )
                .per_service_instance(),
            )
            .build(context(&bus))
            .unwrap();
        module.start().await.unwrap();
        instances.push((module, recorder));
    }

    assert_eq!(bus.queue_names().iter().filter(|q| q.starts_with("billing_")).count(), 2);

    publisher
        .publish_message(&OrderPlaced { id: 1 }, &CancellationToken::new())
        .await
        .unwrap();

    for (_, recorder) in &instances {
        assert!(eventually(|| recorder.count() == 1).await);
    }
}

#[tokio::test]
async fn work_queue_replies_reach_the_sender_queue() {
    let bus = InMemoryBroker::new("busA");
    let billing = Recorder::replying("OrderCharged");
    let server = BusTopology::new()
        .work_queue(
            QueueMeta::new("busA", QueueDefinition::new("billing"))
                .dispatch(DispatchInfo::shared("ChargeOrder", Arc::new(billing.clone()))),
        )
        .build(context(&bus))
        .unwrap();
    server.start().await.unwrap();

    let charges = Recorder::default();
    let sender = BusTopology::new()
        .queue_publisher(
            QueueMeta::new("busA", QueueDefinition::new("billing"))
                .message_type("ChargeOrder")
                .reply_queue("charges"),
        )
        .work_queue(
            QueueMeta::new("busA", QueueDefinition::new("charges"))
                .dispatch(DispatchInfo::shared("OrderCharged", Arc::new(charges.clone()))),
        )
        .build(context(&bus))
        .unwrap();
    sender.start().await.unwrap();

    sender
        .publish(
            &BusMessage::new("ChargeOrder", json!({"id": 3})).with_correlation_id("c-3"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(eventually(|| charges.count() == 1).await);
    assert_eq!(billing.count(), 1);
    let reply = charges.seen.lock().unwrap()[0].clone();
    assert_eq!(reply.correlation_id.as_deref(), Some("c-3"));
}

#[tokio::test]
async fn rpc_survives_a_reconnect() {
    let bus = InMemoryBroker::new("busA");
    let server = Arc::new(pricing_server(&bus).await);
    let client = Arc::new(pricing_client(&bus, 1_000).await);
    server.watch_connections();
    client.watch_connections();

    bus.simulate_connection_failure();

    let rpc = client.rpc_client("pricing").unwrap();
    assert!(eventually(|| bus.is_connected() && bus.consumer_count(rpc.reply_queue_name()) == 1).await);
    assert!(eventually(|| bus.consumer_count("pricing") == 1).await);

    let price = rpc
        .send(&GetPrice { sku: "B-2".to_owned() }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(price.sku, "B-2");

    client.dispose().await;
    server.dispose().await;
}
