use crate::error::{EventBusError, EventBusResult};
use crate::event::IntegrationEvent;
use crate::handler::{HandlerKey, HandlerScope, IntegrationEventHandler};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// 单个处理器订阅：处理器类型标识 + 类型擦除后的调用器
#[derive(Clone)]
pub struct SubscriptionInfo {
    handler: HandlerKey,
    invoker: Arc<dyn HandlerInvoker>,
}

impl SubscriptionInfo {
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            handler: HandlerKey::of::<H>(),
            invoker: Arc::new(TypedInvoker::<E, H>(PhantomData)),
        }
    }

    pub fn handler(&self) -> &HandlerKey {
        &self.handler
    }

    /// 在 `scope` 中解析处理器并处理已解码的事件
    pub async fn invoke(
        &self,
        scope: &dyn HandlerScope,
        event: &(dyn Any + Send + Sync),
    ) -> EventBusResult<()> {
        self.invoker.invoke(scope, event).await
    }
}

impl fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler", &self.handler)
            .finish()
    }
}

#[async_trait]
trait HandlerInvoker: Send + Sync {
    async fn invoke(
        &self,
        scope: &dyn HandlerScope,
        event: &(dyn Any + Send + Sync),
    ) -> EventBusResult<()>;
}

struct TypedInvoker<E, H>(PhantomData<fn() -> (E, H)>);

#[async_trait]
impl<E, H> HandlerInvoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(
        &self,
        scope: &dyn HandlerScope,
        event: &(dyn Any + Send + Sync),
    ) -> EventBusResult<()> {
        let key = HandlerKey::of::<H>();
        let event = event
            .downcast_ref::<E>()
            .ok_or_else(|| EventBusError::TypeMismatch {
                expected: std::any::type_name::<E>().to_string(),
                found: "another event type".to_string(),
            })?;
        let instance = scope
            .resolve(&key)
            .ok_or_else(|| EventBusError::HandlerNotResolved {
                handler: key.type_name().to_string(),
            })?;
        let handler = instance
            .downcast::<H>()
            .map_err(|_| EventBusError::TypeMismatch {
                expected: key.type_name().to_string(),
                found: "another handler type".to_string(),
            })?;

        handler
            .handle(event)
            .await
            .map_err(|err| EventBusError::HandlerFailed {
                handler: key.type_name().to_string(),
                reason: format!("{err:#}"),
            })
    }
}
