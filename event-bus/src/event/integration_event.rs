use super::meta::{EventId, EventMeta, Timestamp};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// 集成事件载荷需要满足的通用能力边界
///
/// 事件名即路由键，在整个已注册事件空间内必须唯一；注册表会拒绝
/// 两个同名的不同类型。通常由 `#[integration_event]` 宏实现。
pub trait IntegrationEvent:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// 事件名（默认为去掉模块路径的类型名）
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        simple_type_name::<Self>()
    }

    /// 事件身份元数据
    fn meta(&self) -> &EventMeta;

    fn id(&self) -> EventId {
        self.meta().id()
    }

    fn creation_date(&self) -> Timestamp {
        self.meta().creation_date()
    }
}

/// 类型的简单名称：`my_app::events::OrderCreated` -> `OrderCreated`
///
/// 泛型类型保留其参数部分（如 `Wrapper<my_app::Inner>`），泛型事件应显式覆写 `event_name`。
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    mod nested {
        pub struct OrderShipped;
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PlainEvent {
        #[serde(flatten)]
        meta: EventMeta,
    }

    impl IntegrationEvent for PlainEvent {
        fn meta(&self) -> &EventMeta {
            &self.meta
        }
    }

    #[test]
    fn simple_type_name_strips_module_path() {
        assert_eq!(simple_type_name::<nested::OrderShipped>(), "OrderShipped");
        assert_eq!(simple_type_name::<u32>(), "u32");
    }

    #[test]
    fn default_event_name_is_simple_type_name() {
        assert_eq!(PlainEvent::event_name(), "PlainEvent");
        let ev = PlainEvent {
            meta: EventMeta::new(),
        };
        assert_eq!(ev.id(), ev.meta.id());
    }
}
