use super::SubscriptionInfo;
use crate::error::{EventBusError, EventBusResult};
use crate::event::{EventDescriptor, IntegrationEvent};
use crate::handler::{HandlerKey, IntegrationEventHandler};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// 订阅注册表
///
/// 不做内部同步：由持有它的消费者加锁后独占修改。不变式：
/// - 事件名存在于 `handlers` 中当且仅当它至少有一个订阅；
/// - `event_types` 的键集合与 `handlers` 的键集合始终一致；
/// - 最后一个订阅被移除时，两处同时删除并发出一次移除通知。
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    handlers: HashMap<String, Vec<SubscriptionInfo>>,
    event_types: HashMap<String, EventDescriptor>,
    removal_listeners: Vec<mpsc::UnboundedSender<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 事件键：事件名
    pub fn event_key<E: IntegrationEvent>() -> &'static str {
        E::event_name()
    }

    /// 注册移除通知：最后一个订阅被移除时收到事件名
    pub fn on_event_removed(&mut self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.removal_listeners.push(tx);
        rx
    }

    /// 校验 (E, H) 能否注册：重复注册或事件名冲突时返回错误
    pub fn ensure_can_add<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = Self::event_key::<E>();
        let descriptor = EventDescriptor::of::<E>();

        if let Some(registered) = self.event_types.get(event_name) {
            if registered.type_id() != descriptor.type_id() {
                return Err(EventBusError::EventNameConflict {
                    event_name: event_name.to_string(),
                    registered: registered.type_name().to_string(),
                    found: descriptor.type_name().to_string(),
                });
            }
        }

        let key = HandlerKey::of::<H>();
        let duplicated = self
            .handlers
            .get(event_name)
            .is_some_and(|subs| subs.iter().any(|s| *s.handler() == key));
        if duplicated {
            return Err(EventBusError::DuplicateRegistration {
                event_name: event_name.to_string(),
                handler: key.type_name().to_string(),
            });
        }

        Ok(())
    }

    pub fn add_subscription<E, H>(&mut self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_can_add::<E, H>()?;

        let event_name = Self::event_key::<E>();
        self.handlers
            .entry(event_name.to_string())
            .or_default()
            .push(SubscriptionInfo::typed::<E, H>());
        self.event_types
            .entry(event_name.to_string())
            .or_insert_with(EventDescriptor::of::<E>);

        Ok(())
    }

    /// 移除 (E, H) 的订阅；不存在时静默返回
    pub fn remove_subscription<E, H>(&mut self)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = Self::event_key::<E>();
        let key = HandlerKey::of::<H>();

        let Some(subs) = self.handlers.get_mut(event_name) else {
            return;
        };
        let Some(pos) = subs.iter().position(|s| *s.handler() == key) else {
            return;
        };
        subs.remove(pos);

        if subs.is_empty() {
            self.handlers.remove(event_name);
            self.event_types.remove(event_name);
            self.raise_event_removed(event_name);
        }
    }

    /// 严格查询：事件名无订阅时返回 `SubscriptionNotFound`
    pub fn handlers_for_event(&self, event_name: &str) -> EventBusResult<&[SubscriptionInfo]> {
        self.handlers
            .get(event_name)
            .map(Vec::as_slice)
            .ok_or_else(|| EventBusError::SubscriptionNotFound {
                event_name: event_name.to_string(),
            })
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    pub fn event_type_by_name(&self, event_name: &str) -> Option<&EventDescriptor> {
        self.event_types.get(event_name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// 已订阅的事件名
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// 清空全部订阅，不发出移除通知
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.event_types.clear();
    }

    fn raise_event_removed(&mut self, event_name: &str) {
        self.removal_listeners
            .retain(|tx| tx.send(event_name.to_string()).is_ok());
    }
}
