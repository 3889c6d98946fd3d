//! broker 端口
//!
//! 事件总线只依赖这里定义的最小协议，不绑定具体的消息中间件：
//! - `BrokerConnector`：建立物理连接；
//! - `BrokerConnection`：连接状态、信号流（关闭/阻塞/回调异常）与通道创建；
//! - `BrokerChannel`：轻量通道，声明交换机/队列、绑定/解绑、发布、消费与查询队列深度；
//! - `Delivery`：一次投递，需手动确认（ack）或拒绝并重新入队（nack）。
//!
//! 内置两种实现：`inmemory`（测试与本地开发）与 `amqp`（RabbitMQ，需开启 `amqp` 特性）。
//!
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod inmemory;

pub use inmemory::InMemoryBroker;

use crate::error::BrokerResult;
use crate::event::Timestamp;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// 连接工厂
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// 物理连接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// 连接信号流；连接关闭后流结束
    fn signals(&self) -> BoxStream<'static, ConnectionSignal>;

    async fn create_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>>;

    async fn close(&self) -> BrokerResult<()>;
}

/// 通道：廉价、短生命周期，不在并发操作间共享
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, exchange: &str, durable: bool) -> BrokerResult<()>;

    /// 声明队列，返回当前就绪消息数
    async fn queue_declare(&self, queue: &str, durable: bool) -> BrokerResult<u32>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str)
    -> BrokerResult<()>;

    /// 队列中就绪（未投递）的消息数；队列不存在时返回 `NotFound`
    async fn message_count(&self, queue: &str) -> BrokerResult<u32>;

    /// 清空就绪消息，返回被清除的数量
    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32>;

    /// 限制本通道上未确认投递的数量，0 表示不限制
    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        payload: &[u8],
    ) -> BrokerResult<()>;

    /// 以手动确认模式开始消费；流中的错误表示通道回调失败
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>>;

    /// 关闭通道；本通道上未确认的投递会回到队列
    async fn close(&self) -> BrokerResult<()>;
}

/// 连接级信号，均会触发重连
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Shutdown { reason: String },
    Blocked { reason: String },
    CallbackException { reason: String },
}

impl fmt::Display for ConnectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionSignal::Shutdown { reason } => write!(f, "shutdown: {reason}"),
            ConnectionSignal::Blocked { reason } => write!(f, "blocked: {reason}"),
            ConnectionSignal::CallbackException { reason } => {
                write!(f, "callback exception: {reason}")
            }
        }
    }
}

/// 传输元数据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// 持久化投递（delivery mode 2）
    pub persistent: bool,
    pub priority: u8,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<Timestamp>,
}

/// 投递确认
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// 一次消息投递
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        routing_key: String,
        payload: Vec<u8>,
        redelivered: bool,
        properties: MessageProperties,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key,
            payload,
            redelivered,
            properties,
            acker,
        }
    }

    /// 确认：消息从队列中永久移除
    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    /// 拒绝：`requeue` 为 true 时消息回到队列等待重新投递
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
