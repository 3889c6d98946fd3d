//! 事件发布端（EventBusPublisher）
//!
//! 每次发布使用独立的短生命周期通道：声明 durable direct 交换机，按事件的具体类型
//! 序列化，以事件名为路由键、`mandatory` 与持久化标记发送；发送在重试策略下进行。
//! 正常返回表示 broker 已接受该消息用于路由。
//!
use crate::broker::{BrokerChannel, MessageProperties};
use crate::config::PublisherConfig;
use crate::connection::PersistentConnection;
use crate::error::{EventBusError, EventBusResult};
use crate::event::{IntegrationEvent, codec};

#[derive(Clone)]
pub struct EventBusPublisher {
    connection: PersistentConnection,
    config: PublisherConfig,
}

impl EventBusPublisher {
    pub fn new(connection: PersistentConnection, config: PublisherConfig) -> Self {
        Self { connection, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// 以默认优先级 0 发布
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> EventBusResult<()> {
        self.publish_with_priority(event, 0).await
    }

    pub async fn publish_with_priority<E: IntegrationEvent>(
        &self,
        event: &E,
        priority: u8,
    ) -> EventBusResult<()> {
        if !self.connection.ensure_connected().await {
            return Err(EventBusError::invalid_state(
                "no broker connection is available to publish",
            ));
        }

        let channel = self.connection.create_channel().await?;
        let result = self.publish_on(channel.as_ref(), event, priority).await;

        // 通道在所有退出路径上关闭
        if let Err(err) = channel.close().await {
            tracing::debug!(error = %err, "failed to close publishing channel");
        }

        match &result {
            Ok(()) => tracing::debug!(
                event_name = E::event_name(),
                event_id = %event.id(),
                priority,
                "event published"
            ),
            Err(err) => tracing::warn!(
                event_name = E::event_name(),
                event_id = %event.id(),
                error = %err,
                "failed to publish event"
            ),
        }
        result
    }

    async fn publish_on<E: IntegrationEvent>(
        &self,
        channel: &dyn BrokerChannel,
        event: &E,
        priority: u8,
    ) -> EventBusResult<()> {
        let exchange = self.config.exchange.as_str();
        channel.exchange_declare(exchange, true).await?;

        let payload = codec::serialize(event)?;
        let routing_key = E::event_name();

        self.config
            .retry
            .run("publish", || {
                let properties = MessageProperties {
                    persistent: true,
                    priority,
                    content_type: Some(codec::CONTENT_TYPE.to_string()),
                    message_id: Some(event.id().to_string()),
                    timestamp: Some(event.creation_date()),
                };
                channel.basic_publish(exchange, routing_key, true, properties, &payload)
            })
            .await
            .map_err(|err| err.into_event_bus_error("publish"))
    }
}
