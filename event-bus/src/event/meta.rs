use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type EventId = Uuid;
pub type Timestamp = DateTime<Utc>;

/// 事件身份：唯一标识与创建时间（UTC），创建后不可变
///
/// 通过 `#[serde(flatten)]` 嵌入具体事件，序列化后与负载字段位于同一层级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventMeta {
    id: EventId,
    creation_date: Timestamp,
}

impl EventMeta {
    /// 生成新的事件身份（v4 UUID + 当前 UTC 时间）
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn creation_date(&self) -> Timestamp {
        self.creation_date
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}
