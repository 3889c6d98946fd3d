//! AMQP 0-9-1 适配器（RabbitMQ，基于 lapin）
//!
//! 将 broker 端口映射到 lapin 的连接与通道：
//! - 交换机为 durable direct，队列为 durable；
//! - 发布设置 delivery mode 2（持久化）、优先级与 `mandatory`；
//! - 消费使用手动确认，`nack(requeue)` 对应 `basic.nack`；
//! - 连接错误回调转换为 `ConnectionSignal::Shutdown`。
//!
//! 仅在开启 `amqp` 特性时编译。
//!
use super::{
    Acker, BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal, Delivery,
    MessageProperties,
};
use crate::error::{BrokerError, BrokerResult, EventBusError, EventBusResult};
use async_trait::async_trait;
use bon::Builder;
use chrono::DateTime;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 连接参数
#[derive(Clone, Debug, Builder)]
pub struct AmqpSettings {
    #[builder(into, default = "localhost".to_string())]
    pub host: String,
    #[builder(default = 5672)]
    pub port: u16,
    #[builder(into, default = "/".to_string())]
    pub virtual_host: String,
    #[builder(into, default = "guest".to_string())]
    pub user: String,
    #[builder(into, default = "guest".to_string())]
    pub password: String,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AmqpSettings {
    /// 从环境变量读取：`EVENT_BUS_AMQP_HOST`、`_PORT`、`_VHOST`、`_USER`、`_PASSWORD`，
    /// 缺省项使用默认值
    pub fn from_env() -> EventBusResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EventBusResult<Self> {
        let defaults = Self::default();
        let port = match lookup("EVENT_BUS_AMQP_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                EventBusError::invalid_state(format!("invalid EVENT_BUS_AMQP_PORT: {raw}"))
            })?,
            None => defaults.port,
        };

        Ok(Self {
            host: lookup("EVENT_BUS_AMQP_HOST").unwrap_or(defaults.host),
            port,
            virtual_host: lookup("EVENT_BUS_AMQP_VHOST").unwrap_or(defaults.virtual_host),
            user: lookup("EVENT_BUS_AMQP_USER").unwrap_or(defaults.user),
            password: lookup("EVENT_BUS_AMQP_PASSWORD").unwrap_or(defaults.password),
        })
    }

    pub fn uri(&self) -> String {
        let vhost = if self.virtual_host == "/" {
            "%2f".to_string()
        } else {
            self.virtual_host.trim_start_matches('/').to_string()
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// 基于 lapin 的连接工厂
///
/// 连接信号只来自 lapin 的 `on_error` 回调，统一映射为 `ConnectionSignal::Shutdown`；
/// lapin 没有暴露 connection.blocked 与回调异常的钩子，因此该适配器不会产出
/// `Blocked` 或 `CallbackException`。
#[derive(Clone, Debug)]
pub struct AmqpConnector {
    settings: AmqpSettings,
}

impl AmqpConnector {
    pub fn new(settings: AmqpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(&self.settings.uri(), ConnectionProperties::default())
            .await
            .map_err(|err| match err {
                lapin::Error::IOError(io) => BrokerError::Unreachable {
                    reason: io.to_string(),
                },
                other => map_error(other),
            })?;

        let (signals, _rx) = broadcast::channel(16);
        let tx = signals.clone();
        connection.on_error(move |err| {
            let _ = tx.send(ConnectionSignal::Shutdown {
                reason: err.to_string(),
            });
        });
        tracing::debug!(host = %self.settings.host, port = self.settings.port, "amqp connection opened");

        Ok(Arc::new(AmqpConnection {
            connection,
            signals,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    fn signals(&self) -> BoxStream<'static, ConnectionSignal> {
        BroadcastStream::new(self.signals.subscribe())
            .filter_map(|r| async move { r.ok() })
            .boxed()
    }

    async fn create_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(map_error)?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection.close(200, "OK").await.map_err(map_error)
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn exchange_declare(&self, exchange: &str, durable: bool) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> BrokerResult<u32> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(declared.message_count())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(map_error)
    }

    async fn message_count(&self, queue: &str) -> BrokerResult<u32> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;
        Ok(declared.message_count())
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(map_error)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(map_error)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        payload: &[u8],
    ) -> BrokerResult<()> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    ..Default::default()
                },
                payload,
                to_amqp_properties(properties),
            )
            .await
            .map_err(map_error)?
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)?;

        Ok(consumer
            .map(|item| item.map(from_amqp_delivery).map_err(map_error))
            .boxed())
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel.close(200, "OK").await.map_err(map_error)
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_error)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(map_error)
    }
}

fn to_amqp_properties(properties: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_priority(properties.priority);
    if properties.persistent {
        amqp = amqp.with_delivery_mode(2);
    }
    if let Some(content_type) = properties.content_type {
        amqp = amqp.with_content_type(content_type.into());
    }
    if let Some(message_id) = properties.message_id {
        amqp = amqp.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp.timestamp().max(0) as u64);
    }
    amqp
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let properties = MessageProperties {
        persistent: *props.delivery_mode() == Some(2),
        priority: props.priority().unwrap_or_default(),
        content_type: props.content_type().as_ref().map(|s| s.to_string()),
        message_id: props.message_id().as_ref().map(|s| s.to_string()),
        timestamp: props
            .timestamp()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
    };

    Delivery::new(
        delivery.delivery_tag,
        delivery.routing_key.to_string(),
        delivery.data,
        delivery.redelivered,
        properties,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

fn map_error(err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::IOError(io) => BrokerError::Network {
            reason: io.to_string(),
        },
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
        lapin::Error::InvalidChannelState(state) => BrokerError::ChannelClosed {
            reason: format!("{state:?}"),
        },
        other => BrokerError::Protocol {
            reason: other.to_string(),
        },
    }
}
