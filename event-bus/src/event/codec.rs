//! 事件编解码
//!
//! 以 JSON 作为传输格式，按事件的具体类型序列化；接收端根据注册表中记录的
//! 同名类型反序列化。`content_type` 随消息元数据一并发送。
//!
use super::IntegrationEvent;
use crate::error::EventBusResult;

pub const CONTENT_TYPE: &str = "application/json";

pub fn serialize<E: IntegrationEvent>(event: &E) -> EventBusResult<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

pub fn deserialize<E: IntegrationEvent>(payload: &[u8]) -> EventBusResult<E> {
    Ok(serde_json::from_slice(payload)?)
}
