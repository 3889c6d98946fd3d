use anyhow::Result as AnyResult;
use async_trait::async_trait;
use event_bus::broker::InMemoryBroker;
use event_bus::event::EventMeta;
use event_bus::{
    ConsumerConfig, EventBusConsumer, EventBusPublisher, HandlerContainer, IntegrationEvent,
    IntegrationEventHandler, PersistentConnection, PublisherConfig, RetryPolicy,
};
use event_bus_macros::integration_event;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[integration_event(name = "orders.placed")]
struct OrderPlaced {
    order_id: String,
    sku: String,
    quantity: u32,
}

#[integration_event(name = "orders.cancelled")]
struct OrderCancelled {
    order_id: String,
    reason: String,
}

/// 库存投影：下单预留、取消释放
#[derive(Default)]
struct Inventory {
    reserved: Mutex<HashMap<String, (String, u32)>>,
}

impl Inventory {
    fn reserved_total(&self) -> u32 {
        self.reserved
            .lock()
            .map(|r| r.values().map(|(_, q)| q).sum())
            .unwrap_or_default()
    }
}

struct ReserveStock(Arc<Inventory>);

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for ReserveStock {
    async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
        anyhow::ensure!(event.quantity > 0, "order {} has no items", event.order_id);
        let mut reserved = self
            .0
            .reserved
            .lock()
            .map_err(|_| anyhow::anyhow!("inventory lock poisoned"))?;
        reserved.insert(event.order_id.clone(), (event.sku.clone(), event.quantity));
        tracing::info!(order_id = %event.order_id, sku = %event.sku, quantity = event.quantity, "stock reserved");
        Ok(())
    }
}

struct ReleaseStock(Arc<Inventory>);

#[async_trait]
impl IntegrationEventHandler<OrderCancelled> for ReleaseStock {
    async fn handle(&self, event: &OrderCancelled) -> anyhow::Result<()> {
        let mut reserved = self
            .0
            .reserved
            .lock()
            .map_err(|_| anyhow::anyhow!("inventory lock poisoned"))?;
        if let Some((sku, quantity)) = reserved.remove(&event.order_id) {
            tracing::info!(order_id = %event.order_id, %sku, quantity, reason = %event.reason, "stock released");
        }
        Ok(())
    }
}

/// 每条消息新建一次的审计处理器
struct AuditTrail;

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for AuditTrail {
    async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
        tracing::info!(
            event_name = OrderPlaced::event_name(),
            event_id = %event.id(),
            created_at = %event.creation_date(),
            "audit"
        );
        Ok(())
    }
}

async fn wait_until_drained(consumer: &EventBusConsumer) -> AnyResult<()> {
    for _ in 0..50 {
        if !consumer.has_messages().await? {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("queue was not drained in time")
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = InMemoryBroker::new();
    let retry = RetryPolicy::builder()
        .first_delay(Duration::from_millis(200))
        .build();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), retry);

    let inventory = Arc::new(Inventory::default());
    let mut container = HandlerContainer::new();
    container
        .register_instance(Arc::new(ReserveStock(inventory.clone())))
        .register_instance(Arc::new(ReleaseStock(inventory.clone())))
        .register_factory(|| AuditTrail);

    let consumer = EventBusConsumer::start(
        connection.clone(),
        Arc::new(container),
        ConsumerConfig::builder()
            .queue_name("inventory")
            .prefetch_count(4)
            .handler_timeout(Duration::from_secs(5))
            .build(),
    )
    .await?;
    consumer.subscribe::<OrderPlaced, ReserveStock>().await?;
    consumer.subscribe::<OrderPlaced, AuditTrail>().await?;
    consumer.subscribe::<OrderCancelled, ReleaseStock>().await?;

    let publisher = EventBusPublisher::new(connection.clone(), PublisherConfig::default());
    for (order_id, sku, quantity) in [("o-1", "apple", 3), ("o-2", "pear", 2)] {
        publisher
            .publish(&OrderPlaced {
                meta: EventMeta::new(),
                order_id: order_id.into(),
                sku: sku.into(),
                quantity,
            })
            .await?;
    }
    publisher
        .publish_with_priority(
            &OrderCancelled {
                meta: EventMeta::new(),
                order_id: "o-2".into(),
                reason: "customer request".into(),
            },
            5,
        )
        .await?;

    wait_until_drained(&consumer).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(reserved = inventory.reserved_total(), "inventory after first batch");

    // broker 断开后自动重连，消费继续
    broker.drop_connections("simulated broker restart");
    publisher
        .publish(&OrderPlaced {
            meta: EventMeta::new(),
            order_id: "o-3".into(),
            sku: "plum".into(),
            quantity: 1,
        })
        .await?;
    wait_until_drained(&consumer).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    tracing::info!(reserved = inventory.reserved_total(), "inventory after reconnect");

    consumer.unsubscribe::<OrderPlaced, AuditTrail>().await?;
    consumer.unsubscribe::<OrderPlaced, ReserveStock>().await?;
    consumer.unsubscribe::<OrderCancelled, ReleaseStock>().await?;
    tracing::info!(receiving = consumer.is_receiving().await, "all handlers removed");

    consumer.shutdown().await;
    connection.dispose().await;
    Ok(())
}
