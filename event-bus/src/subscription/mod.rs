//! 订阅注册表
//!
//! 内存中的路由表：事件名 -> 有序的处理器订阅列表，以及事件名 -> 事件类型的
//! 反查表。最后一个处理器被移除时，发出携带事件名的移除通知，消费端据此解绑路由。
//!
mod info;
mod registry;

pub use info::SubscriptionInfo;
pub use registry::SubscriptionRegistry;
