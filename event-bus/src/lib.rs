//! 基于消息中间件的事件总线（event-bus）
//!
//! 在 broker 连接之上提供类型化的发布/订阅：
//! - 持久连接（`connection`）：独占唯一物理连接，按指数退避重试并在连接信号后自动重连；
//! - 订阅注册表（`subscription`）：事件名到处理器的有序映射，保证唯一性并在最后一个处理器
//!   移除时发出通知；
//! - 发布端（`publisher`）与消费端（`consumer`）：序列化传输、路由绑定/解绑，
//!   以及“接收 → 解析处理器 → 执行 → 确认/拒绝重入队”的分发循环，至少一次投递；
//! - broker 端口（`broker`）：最小协议与内存实现，`amqp` 特性下提供 RabbitMQ 适配。
//!
//! 典型用法：
//! 1. 用 `#[integration_event]` 定义事件，为处理器实现 `IntegrationEventHandler<E>`；
//! 2. 在 `HandlerContainer` 中注册处理器实例或工厂；
//! 3. 创建 `PersistentConnection`，据此启动 `EventBusConsumer` 并 `subscribe::<E, H>()`；
//! 4. 通过 `EventBusPublisher::publish` 发布事件。
//!
pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event;
pub mod handler;
pub mod publisher;
pub mod retry;
pub mod subscription;

pub use config::{ConsumerConfig, DEFAULT_EXCHANGE, PublisherConfig};
pub use connection::PersistentConnection;
pub use consumer::EventBusConsumer;
pub use error::{BrokerError, EventBusError, EventBusResult};
pub use event::{EventMeta, IntegrationEvent};
pub use handler::{HandlerContainer, HandlerResolver, IntegrationEventHandler};
pub use publisher::EventBusPublisher;
pub use retry::RetryPolicy;

// 允许在本 crate 内部通过 ::event_bus 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::event_bus 路径。
extern crate self as event_bus;
