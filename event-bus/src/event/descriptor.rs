use super::{IntegrationEvent, codec};
use crate::error::EventBusResult;
use std::any::{Any, TypeId};
use std::fmt;

type Decoder = fn(&[u8]) -> EventBusResult<Box<dyn Any + Send + Sync>>;

/// 已注册事件类型的描述：线上消息只携带事件名，分发时据此反查并解码
#[derive(Clone, Copy)]
pub struct EventDescriptor {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: Decoder,
}

impl EventDescriptor {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_erased::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// 将负载解码为该描述对应的具体事件类型
    pub fn decode(&self, payload: &[u8]) -> EventBusResult<Box<dyn Any + Send + Sync>> {
        (self.decode)(payload)
    }
}

impl fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_erased<E: IntegrationEvent>(payload: &[u8]) -> EventBusResult<Box<dyn Any + Send + Sync>> {
    let event: E = codec::deserialize(payload)?;
    Ok(Box::new(event))
}
