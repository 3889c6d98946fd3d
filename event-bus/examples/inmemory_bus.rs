/// 事件总线（内存 broker）示例
/// 展示 发布 -> 路由 -> 处理器 -> 确认 的闭环，以及处理器失败后的拒绝并重新入队
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use event_bus::broker::InMemoryBroker;
use event_bus::event::EventMeta;
use event_bus::{
    ConsumerConfig, EventBusConsumer, EventBusPublisher, HandlerContainer,
    IntegrationEventHandler, PersistentConnection, PublisherConfig, RetryPolicy,
};
use event_bus_macros::integration_event;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ============================================================================
// 事件
// ============================================================================

#[integration_event]
struct UserRegistered {
    user_id: String,
    email: String,
}

// ============================================================================
// 处理器
// ============================================================================

struct WelcomeMailer;

#[async_trait]
impl IntegrationEventHandler<UserRegistered> for WelcomeMailer {
    async fn handle(&self, event: &UserRegistered) -> anyhow::Result<()> {
        println!("[mailer] welcome mail to {} ({})", event.email, event.user_id);
        Ok(())
    }
}

/// 第一次处理失败，之后成功：演示重新入队后的重投
#[derive(Default)]
struct FlakyCrm {
    attempts: AtomicUsize,
}

#[async_trait]
impl IntegrationEventHandler<UserRegistered> for FlakyCrm {
    async fn handle(&self, event: &UserRegistered) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            anyhow::bail!("crm unavailable");
        }
        println!("[crm] synced {} on attempt {attempt}", event.user_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = InMemoryBroker::new();
    let retry = RetryPolicy::builder()
        .first_delay(Duration::from_millis(100))
        .build();
    let connection = PersistentConnection::new(Arc::new(broker.clone()), retry);

    let crm = Arc::new(FlakyCrm::default());
    let mut container = HandlerContainer::new();
    container
        .register_factory(|| WelcomeMailer)
        .register_instance(crm.clone());

    let consumer = EventBusConsumer::start(
        connection.clone(),
        Arc::new(container),
        ConsumerConfig::new("user-onboarding"),
    )
    .await?;
    consumer.subscribe::<UserRegistered, WelcomeMailer>().await?;
    consumer.subscribe::<UserRegistered, FlakyCrm>().await?;

    let publisher = EventBusPublisher::new(connection.clone(), PublisherConfig::default());
    publisher
        .publish(&UserRegistered {
            meta: EventMeta::new(),
            user_id: "u-1".into(),
            email: "ada@example.com".into(),
        })
        .await?;

    // 等待重投完成并被确认
    for _ in 0..100 {
        if crm.attempts.load(Ordering::SeqCst) >= 2 && !consumer.has_messages().await? {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!(
        "crm attempts: {}, queue empty: {}",
        crm.attempts.load(Ordering::SeqCst),
        !consumer.has_messages().await?
    );

    consumer.shutdown().await;
    connection.dispose().await;
    Ok(())
}
