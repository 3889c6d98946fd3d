use event_bus::event::{EventMeta, IntegrationEvent};
use event_bus_macros::integration_event;
use serde::{Deserialize, Serialize};

// 已声明 meta 字段时保留原定义，派生去重
#[integration_event]
#[derive(Serialize, Deserialize)]
struct StockReserved {
    sku: String,
    #[serde(flatten)]
    meta: EventMeta,
    quantity: u32,
}

fn main() {
    let meta = EventMeta::new();
    let event = StockReserved {
        sku: "sku-1".into(),
        meta,
        quantity: 3,
    };

    assert_eq!(StockReserved::event_name(), "StockReserved");
    assert_eq!(event.id(), meta.id());
    assert_eq!(event.creation_date(), meta.creation_date());
}
