//! 发布端与消费端配置
//!
use crate::retry::RetryPolicy;
use bon::Builder;
use std::time::Duration;

/// 发布端与消费端共用的默认交换机
pub const DEFAULT_EXCHANGE: &str = "event_bus";

/// 发布端配置
#[derive(Clone, Debug, Builder)]
pub struct PublisherConfig {
    /// 目标交换机（durable direct）
    #[builder(into, default = DEFAULT_EXCHANGE.to_string())]
    pub exchange: String,
    /// 发送失败时的重试策略
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 消费端配置
#[derive(Clone, Debug, Builder)]
pub struct ConsumerConfig {
    #[builder(into, default = DEFAULT_EXCHANGE.to_string())]
    pub exchange: String,
    /// 本消费者的 durable 队列名
    #[builder(into)]
    pub queue_name: String,
    /// 未确认投递上限，同时也是并发处理的投递数上限
    #[builder(default = 1)]
    pub prefetch_count: u16,
    /// 为 false 时只声明拓扑与绑定路由，不启动接收循环
    #[builder(default = true)]
    pub consume: bool,
    #[builder(into, default = "event-bus-consumer".to_string())]
    pub consumer_tag: String,
    /// 单个处理器的执行时限；超时视为处理失败
    pub handler_timeout: Option<Duration>,
}

impl ConsumerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self::builder().queue_name(queue_name).build()
    }
}
