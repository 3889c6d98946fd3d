use anyhow::Result as AnyResult;
use async_trait::async_trait;
use event_bus::broker::InMemoryBroker;
use event_bus::event::EventMeta;
use event_bus::{
    ConsumerConfig, EventBusConsumer, EventBusError, EventBusPublisher, HandlerContainer,
    IntegrationEventHandler, PersistentConnection, PublisherConfig, RetryPolicy,
};
use event_bus_macros::integration_event;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

#[integration_event]
struct OrderPlaced {
    order_id: String,
}

#[integration_event]
struct OrderCancelled {
    order_id: String,
}

fn order(id: &str) -> OrderPlaced {
    OrderPlaced {
        meta: EventMeta::new(),
        order_id: id.to_string(),
    }
}

// ============================================================================
// 处理器
// ============================================================================

#[derive(Default)]
struct Counter {
    calls: AtomicUsize,
}

impl Counter {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

struct Recorder(Arc<Counter>);

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for Recorder {
    async fn handle(&self, _event: &OrderPlaced) -> anyhow::Result<()> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Auditor(Arc<Counter>);

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for Auditor {
    async fn handle(&self, _event: &OrderPlaced) -> anyhow::Result<()> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCancelled> for Auditor {
    async fn handle(&self, _event: &OrderCancelled) -> anyhow::Result<()> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct AlwaysFails(Arc<Counter>);

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for AlwaysFails {
    async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("cannot process order {}", event.order_id)
    }
}

#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
    done: AtomicUsize,
}

struct SlowRecorder(Arc<Gauge>);

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for SlowRecorder {
    async fn handle(&self, _event: &OrderPlaced) -> anyhow::Result<()> {
        let now = self.0.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.0.current.fetch_sub(1, Ordering::SeqCst);
        self.0.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Rendezvous {
    barrier: Arc<Barrier>,
    met: Arc<AtomicUsize>,
    timed_out: Arc<AtomicBool>,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for Rendezvous {
    async fn handle(&self, _event: &OrderPlaced) -> anyhow::Result<()> {
        match tokio::time::timeout(Duration::from_secs(2), self.barrier.wait()).await {
            Ok(_) => {
                self.met.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => self.timed_out.store(true, Ordering::SeqCst),
        }
        Ok(())
    }
}

// ============================================================================
// 测试工具
// ============================================================================

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(3)
        .first_delay(Duration::from_millis(5))
        .build()
}

struct Harness {
    broker: InMemoryBroker,
    connection: PersistentConnection,
    publisher: EventBusPublisher,
}

fn harness() -> Harness {
    let broker = InMemoryBroker::new();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), fast_retry());
    let publisher = EventBusPublisher::new(
        connection.clone(),
        PublisherConfig::builder().retry(fast_retry()).build(),
    );
    Harness {
        broker,
        connection,
        publisher,
    }
}

impl Harness {
    async fn consumer(
        &self,
        container: HandlerContainer,
        config: ConsumerConfig,
    ) -> AnyResult<EventBusConsumer> {
        Ok(EventBusConsumer::start(self.connection.clone(), Arc::new(container), config).await?)
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let polling = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(3), polling)
        .await
        .is_ok()
}

// ============================================================================
// 场景
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn successful_handler_acknowledges_the_message() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));

    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    h.publisher.publish(&order("o-1")).await?;

    assert!(eventually(|| counter.calls() == 1).await);
    assert!(eventually(|| h.broker.unacked_count("orders") == Some(0)).await);
    assert_eq!(h.broker.ready_count("orders"), Some(0));
    assert!(!consumer.has_messages().await?);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_handler_requeues_the_message() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(AlwaysFails(counter.clone())));

    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, AlwaysFails>().await?;

    h.publisher.publish(&order("o-2")).await?;

    // 重新入队后被再次投递
    assert!(eventually(|| counter.calls() >= 2).await);

    consumer.shutdown().await;

    assert!(eventually(|| h.broker.unacked_count("orders") == Some(0)).await);
    assert_eq!(h.broker.ready_count("orders"), Some(1));
    assert!(consumer.has_messages().await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn any_failing_handler_rejects_the_whole_delivery() -> AnyResult<()> {
    let h = harness();
    let ok = Arc::new(Counter::default());
    let failing = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container
        .register_instance(Arc::new(Recorder(ok.clone())))
        .register_instance(Arc::new(AlwaysFails(failing.clone())));

    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    consumer.subscribe::<OrderPlaced, AlwaysFails>().await?;

    h.publisher.publish(&order("o-3")).await?;

    // 每次重投都从第一个处理器重新执行
    assert!(eventually(|| failing.calls() >= 2).await);
    assert!(ok.calls() >= 2);

    consumer.shutdown().await;
    assert!(eventually(|| h.broker.ready_count("orders") == Some(1)).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn prefetch_one_processes_deliveries_one_at_a_time() -> AnyResult<()> {
    let h = harness();
    let gauge = Arc::new(Gauge::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(SlowRecorder(gauge.clone())));

    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, SlowRecorder>().await?;

    for id in ["o-1", "o-2", "o-3"] {
        h.publisher.publish(&order(id)).await?;
    }

    assert!(eventually(|| gauge.done.load(Ordering::SeqCst) == 3).await);
    assert_eq!(gauge.max.load(Ordering::SeqCst), 1);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn prefetch_two_runs_two_deliveries_concurrently() -> AnyResult<()> {
    let h = harness();
    let met = Arc::new(AtomicUsize::new(0));
    let timed_out = Arc::new(AtomicBool::new(false));
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Rendezvous {
        barrier: Arc::new(Barrier::new(2)),
        met: met.clone(),
        timed_out: timed_out.clone(),
    }));

    let config = ConsumerConfig::builder()
        .queue_name("orders")
        .prefetch_count(2)
        .build();
    let consumer = h.consumer(container, config).await?;
    consumer.subscribe::<OrderPlaced, Rendezvous>().await?;

    h.publisher.publish(&order("o-1")).await?;
    h.publisher.publish(&order("o-2")).await?;

    assert!(eventually(|| met.load(Ordering::SeqCst) == 2).await);
    assert!(!timed_out.load(Ordering::SeqCst));

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn message_waiting_in_a_bound_queue_is_delivered_after_subscribe() -> AnyResult<()> {
    let h = harness();
    h.broker.bind("orders", "event_bus", "OrderPlaced");
    h.publisher.publish(&order("early")).await?;
    assert_eq!(h.broker.ready_count("orders"), Some(1));

    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    assert!(eventually(|| counter.calls() == 1).await);
    assert!(eventually(|| h.broker.ready_count("orders") == Some(0)).await);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn publishing_twice_yields_two_deliveries() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    let event = order("same");
    h.publisher.publish(&event).await?;
    h.publisher.publish(&event).await?;

    assert!(eventually(|| counter.calls() == 2).await);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_subscription_is_rejected() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;

    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    let err = consumer
        .subscribe::<OrderPlaced, Recorder>()
        .await
        .unwrap_err();

    assert!(matches!(err, EventBusError::DuplicateRegistration { .. }));
    assert!(h.broker.is_bound("orders", "event_bus", "OrderPlaced"));

    h.publisher.publish(&order("o-1")).await?;
    assert!(eventually(|| counter.calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.calls(), 1);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_last_handler_unbinds_and_goes_idle() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container
        .register_instance(Arc::new(Recorder(counter.clone())))
        .register_instance(Arc::new(Auditor(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;

    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    consumer.subscribe::<OrderPlaced, Auditor>().await?;
    consumer.subscribe::<OrderCancelled, Auditor>().await?;

    consumer.unsubscribe::<OrderPlaced, Recorder>().await?;
    assert!(h.broker.is_bound("orders", "event_bus", "OrderPlaced"));

    consumer.unsubscribe::<OrderPlaced, Auditor>().await?;
    assert!(!h.broker.is_bound("orders", "event_bus", "OrderPlaced"));
    assert!(h.broker.is_bound("orders", "event_bus", "OrderCancelled"));
    assert!(consumer.is_receiving().await);

    consumer.unsubscribe::<OrderCancelled, Auditor>().await?;
    assert!(!h.broker.is_bound("orders", "event_bus", "OrderCancelled"));
    assert!(!consumer.is_receiving().await);

    // 再次订阅重新开始消费
    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    assert!(consumer.is_receiving().await);
    h.publisher.publish(&order("again")).await?;
    assert!(eventually(|| counter.calls() == 1).await);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribing_unknown_handler_is_a_no_op() -> AnyResult<()> {
    let h = harness();
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(Arc::default())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    consumer.unsubscribe::<OrderPlaced, Auditor>().await?;

    assert!(consumer.has_subscriptions_for_event("OrderPlaced"));
    assert!(h.broker.is_bound("orders", "event_bus", "OrderPlaced"));
    assert!(consumer.is_receiving().await);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn consumer_recovers_from_channel_failure() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    h.broker.fail_consumers("orders", "callback exception");
    h.publisher.publish(&order("after-failure")).await?;

    assert!(eventually(|| counter.calls() == 1).await);
    assert!(eventually(|| h.broker.ready_count("orders") == Some(0)).await);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn non_consuming_consumer_only_binds_routes() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let config = ConsumerConfig::builder()
        .queue_name("inspection")
        .consume(false)
        .build();
    let consumer = h.consumer(container, config).await?;

    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    h.publisher.publish(&order("o-1")).await?;

    assert!(!consumer.is_receiving().await);
    assert!(consumer.has_messages().await?);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counter.calls(), 0);

    assert_eq!(consumer.purge().await?, 1);
    assert!(!consumer.has_messages().await?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn scoped_handlers_are_built_per_message() -> AnyResult<()> {
    let h = harness();
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    {
        let built = built.clone();
        let counter = counter.clone();
        container.register_factory(move || {
            built.fetch_add(1, Ordering::SeqCst);
            Recorder(counter.clone())
        });
    }
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;

    h.publisher.publish(&order("o-1")).await?;
    h.publisher.publish(&order("o-2")).await?;

    assert!(eventually(|| counter.calls() == 2).await);
    assert_eq!(built.load(Ordering::SeqCst), 2);

    consumer.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn requeue_loop_leaves_the_runtime_responsive() -> AnyResult<()> {
    let h = harness();
    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(AlwaysFails(counter.clone())));

    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderPlaced, AlwaysFails>().await?;
    h.publisher.publish(&order("o-loop")).await?;

    // 单线程运行时：接收循环必须让出执行权，计时器才能触发
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(eventually(|| counter.calls() >= 2).await);

    consumer.shutdown().await;
    assert!(eventually(|| h.broker.ready_count("orders") == Some(1)).await);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn message_for_unsubscribed_route_is_requeued() -> AnyResult<()> {
    let h = harness();
    h.broker.bind("orders", "event_bus", "OrderPlaced");

    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Auditor(counter.clone())));
    let consumer = h.consumer(container, ConsumerConfig::new("orders")).await?;
    consumer.subscribe::<OrderCancelled, Auditor>().await?;

    h.publisher.publish(&order("nobody-listens")).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    consumer.shutdown().await;
    assert!(eventually(|| h.broker.unacked_count("orders") == Some(0)).await);
    assert_eq!(h.broker.ready_count("orders"), Some(1));
    assert_eq!(counter.calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_failing_before_any_delivery_is_recreated_with_backoff() -> AnyResult<()> {
    let broker = InMemoryBroker::new();
    let retry = RetryPolicy::builder()
        .max_retries(3)
        .first_delay(Duration::from_millis(300))
        .build();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), retry);

    let counter = Arc::new(Counter::default());
    let mut container = HandlerContainer::new();
    container.register_instance(Arc::new(Recorder(counter.clone())));
    let consumer = EventBusConsumer::start(
        connection.clone(),
        Arc::new(container),
        ConsumerConfig::new("orders"),
    )
    .await?;
    consumer.subscribe::<OrderPlaced, Recorder>().await?;
    assert!(eventually(|| broker.consumer_count("orders") == Some(1)).await);

    broker.fail_consumers("orders", "callback exception");
    assert!(eventually(|| broker.consumer_count("orders") == Some(0)).await);

    // 退避期间不会立即重建消费通道
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.consumer_count("orders"), Some(0));
    assert!(eventually(|| broker.consumer_count("orders") == Some(1)).await);

    consumer.shutdown().await;
    connection.dispose().await;
    Ok(())
}
