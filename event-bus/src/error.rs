//! 事件总线统一错误定义
//!
//! 按处理策略划分：瞬时传输错误由重试策略吸收，编程/运维错误（重复注册、
//! 无可用连接）立即返回，处理器失败在消费端被转换为“拒绝并重新入队”。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventBusError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    // --- 连接/状态 ---
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("retry exhausted: operation={operation}, attempts={attempts}, last error: {source}")]
    RetryExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    // --- 订阅 ---
    #[error("duplicate registration: handler={handler} is already registered for event '{event_name}'")]
    DuplicateRegistration { event_name: String, handler: String },
    #[error("event name conflict: '{event_name}' is registered by {registered}, found {found}")]
    EventNameConflict {
        event_name: String,
        registered: String,
        found: String,
    },
    #[error("no subscriptions for event '{event_name}'")]
    SubscriptionNotFound { event_name: String },

    // --- 处理器 ---
    #[error("handler not resolved: {handler}")]
    HandlerNotResolved { handler: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    HandlerFailed { handler: String, reason: String },
    #[error("event handler timed out: handler={handler}, timeout={timeout:?}")]
    HandlerTimeout { handler: String, timeout: Duration },
}

impl EventBusError {
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }
}

/// 统一 Result 类型别名
pub type EventBusResult<T> = Result<T, EventBusError>;

/// broker 端口错误
///
/// 只有 `Unreachable` 与 `Network` 属于瞬时错误，会被重试策略重试。
#[non_exhaustive]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable: {reason}")]
    Unreachable { reason: String },
    #[error("network error: {reason}")]
    Network { reason: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel closed: {reason}")]
    ChannelClosed { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
    #[error("unroutable message: exchange={exchange}, routing_key={routing_key}")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl BrokerError {
    /// 是否为可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Network { .. })
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
