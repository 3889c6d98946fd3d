use event_bus::event::IntegrationEvent;
use event_bus_macros::integration_event;

#[integration_event(name = "orders.cancelled")]
#[derive(Default)]
struct OrderCancelled {
    order_id: String,
    reason: Option<String>,
}

fn main() {
    assert_eq!(OrderCancelled::event_name(), "orders.cancelled");

    // 用户自带的派生与宏合并
    let event = OrderCancelled::default();
    assert!(event.reason.is_none());
    assert!(event.order_id.is_empty());
}
