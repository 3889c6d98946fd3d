//! 事件处理器（IntegrationEventHandler）与处理器解析
//!
//! 处理器按类型注册，分发时通过 `HandlerResolver` 为每条消息开启一个作用域，
//! 在作用域内解析出处理器实例；作用域在该消息的全部处理器执行完毕后释放。
//!
mod container;

pub use container::HandlerContainer;

use crate::event::IntegrationEvent;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// 事件处理器：处理某一类型的集成事件
///
/// 同一条消息可能被重复投递（处理失败后整体重新入队，所有处理器从头执行），
/// 处理器应保证幂等。
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// 处理器类型标识：用于订阅去重与实例解析
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerKey {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: std::any::type_name::<H>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// 单条消息的解析作用域
pub trait HandlerScope: Send + Sync {
    /// 解析处理器实例；未注册时返回 `None`
    fn resolve(&self, key: &HandlerKey) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// 处理器解析器：每条消息开启一个新的作用域
pub trait HandlerResolver: Send + Sync {
    fn begin_scope(&self) -> Box<dyn HandlerScope + '_>;
}
