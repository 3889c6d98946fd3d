//! event-bus 的过程宏
//!
use proc_macro::TokenStream;

mod integration_event;
mod utils;

/// 集成事件宏
/// - 追加字段：`#[serde(flatten)] pub meta: ::event_bus::event::EventMeta`（若缺失）
/// - 合并派生：Debug, Clone, PartialEq, Serialize, Deserialize
/// - 实现 `::event_bus::event::IntegrationEvent`
/// - 支持参数：`#[integration_event(name = "...")]` 覆写事件名（即路由键），默认取结构体名
///
/// ```ignore
/// #[integration_event]
/// struct OrderPlaced {
///     order_id: String,
///     amount: i64,
/// }
///
/// let event = OrderPlaced { meta: EventMeta::new(), order_id: "o-1".into(), amount: 10 };
/// ```
#[proc_macro_attribute]
pub fn integration_event(attr: TokenStream, item: TokenStream) -> TokenStream {
    integration_event::expand(attr, item)
}
