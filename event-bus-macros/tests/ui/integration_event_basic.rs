use event_bus::event::{EventMeta, IntegrationEvent};
use event_bus_macros::integration_event;

#[integration_event]
struct OrderPlaced {
    order_id: String,
    amount: i64,
}

fn main() {
    let event = OrderPlaced {
        meta: EventMeta::new(),
        order_id: "o-1".into(),
        amount: 42,
    };

    // 事件名默认取结构体名
    assert_eq!(OrderPlaced::event_name(), "OrderPlaced");
    assert_eq!(event.id(), event.meta.id());

    // Debug/Clone/PartialEq 可用
    let copy = event.clone();
    assert_eq!(copy, event);
    let _ = format!("{:?}", event);

    // meta 被展开到顶层
    let json = serde_json::to_value(&event).unwrap();
    assert!(json.get("id").is_some());
    assert!(json.get("creation_date").is_some());
    assert_eq!(json["amount"], 42);

    let back: OrderPlaced = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
}
