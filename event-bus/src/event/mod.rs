//! 集成事件（Integration Event）
//!
//! 定义在总线上发布与路由的事件需要满足的最小接口（`IntegrationEvent`）、
//! 事件身份元数据（`EventMeta`）、传输编解码（`codec`）以及注册表在
//! 分发时按名称反查事件类型所用的 `EventDescriptor`。

pub mod codec;
mod descriptor;
mod integration_event;
mod meta;

pub use descriptor::EventDescriptor;
pub use integration_event::{IntegrationEvent, simple_type_name};
pub use meta::{EventId, EventMeta, Timestamp};
