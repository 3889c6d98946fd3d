//! 事件消费端（EventBusConsumer）
//!
//! 每个事件名的路由状态：
//! - 首个处理器订阅时把消费队列以事件名为路由键绑定到交换机（UNBOUND → BOUND）；
//! - 同一事件追加处理器只修改注册表；
//! - 最后一个处理器退订时解绑；注册表整体为空时停止接收循环并关闭消费通道，
//!   直到下一次订阅重新开始消费。
//!
//! 接收循环独占一个设置了 prefetch 的通道，投递之间最多并发 prefetch 条，
//! 同一投递的多个处理器按注册顺序依次执行：全部成功才确认，任一失败即拒绝并重新入队。
//! 通道回调失败或通道意外关闭时，释放旧通道并从头重建。
//!
use crate::broker::{BrokerChannel, Delivery};
use crate::config::ConsumerConfig;
use crate::connection::PersistentConnection;
use crate::error::{BrokerResult, EventBusError, EventBusResult};
use crate::event::IntegrationEvent;
use crate::handler::{HandlerResolver, HandlerScope, IntegrationEventHandler};
use crate::subscription::{SubscriptionInfo, SubscriptionRegistry};
use futures_util::StreamExt;
use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct EventBusConsumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    connection: PersistentConnection,
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    // 串行化订阅、退订与接收循环的启停
    topology: tokio::sync::Mutex<Topology>,
    token: CancellationToken,
}

struct Topology {
    removed: mpsc::UnboundedReceiver<String>,
    receiving: Option<ReceiveHandle>,
}

struct ReceiveHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ReceiveHandle {
    async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

impl EventBusConsumer {
    /// 声明交换机与消费队列，`consume` 为 true 时立即开始接收
    pub async fn start(
        connection: PersistentConnection,
        resolver: Arc<dyn HandlerResolver>,
        config: ConsumerConfig,
    ) -> EventBusResult<Self> {
        if !connection.ensure_connected().await {
            return Err(EventBusError::invalid_state(
                "no broker connection is available to start consuming",
            ));
        }
        let channel = connection.create_channel().await?;
        let declared = declare_topology(channel.as_ref(), &config).await;
        close_quietly(channel.as_ref()).await;
        declared?;

        let mut registry = SubscriptionRegistry::new();
        let removed = registry.on_event_removed();
        let dispatcher = Arc::new(Dispatcher {
            registry: Mutex::new(registry),
            resolver,
            handler_timeout: config.handler_timeout,
        });

        let inner = Arc::new(ConsumerInner {
            connection,
            config,
            dispatcher,
            topology: tokio::sync::Mutex::new(Topology {
                removed,
                receiving: None,
            }),
            token: CancellationToken::new(),
        });
        {
            let mut topology = inner.topology.lock().await;
            inner.ensure_receiving(&mut topology);
        }

        tracing::info!(
            exchange = %inner.config.exchange,
            queue = %inner.config.queue_name,
            prefetch = inner.config.prefetch_count,
            consume = inner.config.consume,
            "event bus consumer started"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// 订阅：H 处理事件 E
    ///
    /// 事件首次被订阅时绑定路由；(E, H) 重复注册或事件名冲突时返回错误且不修改任何状态。
    pub async fn subscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let mut topology = self.inner.topology.lock().await;
        let event_name = SubscriptionRegistry::event_key::<E>();

        let first_for_event = {
            let registry = self.inner.dispatcher.registry();
            registry.ensure_can_add::<E, H>()?;
            !registry.has_subscriptions_for_event(event_name)
        };

        if first_for_event {
            self.inner.ensure_receiving(&mut topology);
            self.inner.bind(event_name).await?;
        }
        self.inner.dispatcher.registry().add_subscription::<E, H>()?;

        tracing::info!(
            event_name,
            handler = std::any::type_name::<H>(),
            "subscribed to event"
        );
        Ok(())
    }

    /// 退订；不存在的订阅静默忽略
    pub async fn unsubscribe<E, H>(&self) -> EventBusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let mut topology = self.inner.topology.lock().await;
        let now_empty = {
            let mut registry = self.inner.dispatcher.registry();
            registry.remove_subscription::<E, H>();
            registry.is_empty()
        };
        tracing::info!(
            event_name = E::event_name(),
            handler = std::any::type_name::<H>(),
            "unsubscribed from event"
        );

        let mut first_error = None;
        while let Ok(event_name) = topology.removed.try_recv() {
            if let Err(err) = self.inner.unbind(&event_name).await {
                tracing::warn!(event_name, error = %err, "failed to unbind route");
                first_error.get_or_insert(err);
            }
        }

        if now_empty {
            if let Some(receiving) = topology.receiving.take() {
                receiving.stop().await;
                tracing::info!(queue = %self.inner.config.queue_name, "no subscriptions left, consumer is idle");
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// 消费队列中是否还有就绪消息
    pub async fn has_messages(&self) -> EventBusResult<bool> {
        let channel = self.inner.transient_channel().await?;
        let count = channel.message_count(&self.inner.config.queue_name).await;
        close_quietly(channel.as_ref()).await;
        Ok(count? > 0)
    }

    /// 清空消费队列中的就绪消息，返回清除的数量
    pub async fn purge(&self) -> EventBusResult<u32> {
        let channel = self.inner.transient_channel().await?;
        let purged = channel.queue_purge(&self.inner.config.queue_name).await;
        close_quietly(channel.as_ref()).await;
        Ok(purged?)
    }

    pub async fn is_receiving(&self) -> bool {
        self.inner.topology.lock().await.receiving.is_some()
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.inner
            .dispatcher
            .registry()
            .has_subscriptions_for_event(event_name)
    }

    /// 停止接收循环、关闭消费通道并清空订阅（不解绑路由，也不发出移除通知）
    pub async fn shutdown(&self) {
        let mut topology = self.inner.topology.lock().await;
        if let Some(receiving) = topology.receiving.take() {
            receiving.stop().await;
        }
        self.inner.dispatcher.registry().clear();
        tracing::info!(queue = %self.inner.config.queue_name, "event bus consumer shut down");
    }
}

impl ConsumerInner {
    fn ensure_receiving(&self, topology: &mut Topology) {
        if !self.config.consume || topology.receiving.is_some() {
            return;
        }
        let token = self.token.child_token();
        let receiver = Receiver {
            connection: self.connection.clone(),
            config: self.config.clone(),
            dispatcher: self.dispatcher.clone(),
        };
        let task = tokio::spawn(receiver.run(token.clone()));
        topology.receiving = Some(ReceiveHandle { token, task });
    }

    async fn bind(&self, event_name: &str) -> EventBusResult<()> {
        let exchange = self.config.exchange.as_str();
        let queue = self.config.queue_name.as_str();
        let channel = self.transient_channel().await?;
        let bound = async {
            channel.exchange_declare(exchange, true).await?;
            channel.queue_bind(queue, exchange, event_name).await
        }
        .await;
        close_quietly(channel.as_ref()).await;
        bound?;

        tracing::info!(event_name, exchange, queue, "route bound");
        Ok(())
    }

    async fn unbind(&self, event_name: &str) -> EventBusResult<()> {
        let exchange = self.config.exchange.as_str();
        let queue = self.config.queue_name.as_str();
        let channel = self.transient_channel().await?;
        let unbound = channel.queue_unbind(queue, exchange, event_name).await;
        close_quietly(channel.as_ref()).await;
        unbound?;

        tracing::info!(event_name, exchange, queue, "route unbound");
        Ok(())
    }

    /// 短生命周期通道，用完即关
    async fn transient_channel(&self) -> EventBusResult<Box<dyn BrokerChannel>> {
        if !self.connection.ensure_connected().await {
            return Err(EventBusError::invalid_state(
                "no broker connection is available to perform this action",
            ));
        }
        self.connection.create_channel().await
    }
}

impl Drop for ConsumerInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn declare_topology(channel: &dyn BrokerChannel, config: &ConsumerConfig) -> BrokerResult<()> {
    channel.exchange_declare(&config.exchange, true).await?;
    channel.queue_declare(&config.queue_name, true).await?;
    Ok(())
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        tracing::debug!(error = %err, "failed to close channel");
    }
}

/// 接收循环：独占消费通道，出错时重建
struct Receiver {
    connection: PersistentConnection,
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Receiver {
    async fn run(self, token: CancellationToken) {
        let mut failures = 0u32;
        let concurrency = match self.config.prefetch_count {
            0 => None,
            n => Some(n as usize),
        };

        while !token.is_cancelled() {
            let channel = match self.open_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    failures += 1;
                    let delay = self.connection.retry_policy().delay_for(failures);
                    tracing::warn!(
                        queue = %self.config.queue_name,
                        error = %err,
                        ?delay,
                        "failed to open consuming channel, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let deliveries = match channel
                .basic_consume(&self.config.queue_name, &self.config.consumer_tag)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    close_quietly(channel.as_ref()).await;
                    failures += 1;
                    let delay = self.connection.retry_policy().delay_for(failures);
                    tracing::warn!(queue = %self.config.queue_name, error = %err, ?delay, "basic consume failed, retrying");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };
            tracing::info!(queue = %self.config.queue_name, "consuming");

            // 停止条件：整体关闭或本通道失败
            let channel_token = token.child_token();
            let stop = channel_token.clone();
            let dispatcher = self.dispatcher.as_ref();
            let channel_failed = &channel_token;
            // 至少收到过一条投递才算健康，失败计数在此之后才清零
            let delivered = AtomicBool::new(false);
            let delivered = &delivered;

            deliveries
                .take_until(async move { stop.cancelled().await })
                .for_each_concurrent(concurrency, move |item| async move {
                    match item {
                        Ok(delivery) => {
                            delivered.store(true, Ordering::Relaxed);
                            dispatcher.dispatch(delivery).await
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "consuming channel callback failed");
                            channel_failed.cancel();
                        }
                    }
                })
                .await;

            close_quietly(channel.as_ref()).await;
            if token.is_cancelled() {
                break;
            }
            if delivered.load(Ordering::Relaxed) {
                failures = 0;
                tracing::warn!(queue = %self.config.queue_name, "consuming channel lost, recreating");
                continue;
            }
            failures += 1;
            let delay = self.connection.retry_policy().delay_for(failures);
            tracing::warn!(
                queue = %self.config.queue_name,
                ?delay,
                "consuming channel lost before any delivery, recreating"
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(queue = %self.config.queue_name, "receive loop stopped");
    }

    async fn open_channel(&self) -> EventBusResult<Box<dyn BrokerChannel>> {
        if !self.connection.ensure_connected().await {
            return Err(EventBusError::invalid_state(
                "no broker connection is available to consume",
            ));
        }
        let channel = self.connection.create_channel().await?;
        let prepared = async {
            declare_topology(channel.as_ref(), &self.config).await?;
            channel.basic_qos(self.config.prefetch_count).await
        }
        .await;
        if let Err(err) = prepared {
            close_quietly(channel.as_ref()).await;
            return Err(err.into());
        }
        Ok(channel)
    }
}

/// 分发：按路由键查找订阅、解码、在同一作用域内依次调用处理器
struct Dispatcher {
    registry: Mutex<SubscriptionRegistry>,
    resolver: Arc<dyn HandlerResolver>,
    handler_timeout: Option<Duration>,
}

impl Dispatcher {
    fn registry(&self) -> MutexGuard<'_, SubscriptionRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(&self, delivery: Delivery) {
        let event_name = delivery.routing_key.as_str();
        tracing::debug!(
            event_name,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "delivery received"
        );

        let settled = match self.process(event_name, &delivery.payload).await {
            Ok(()) => delivery.ack().await,
            Err(err) => {
                tracing::warn!(
                    event_name,
                    delivery_tag = delivery.delivery_tag,
                    error = %err,
                    "event not processed, requeueing"
                );
                delivery.nack(true).await
            }
        };
        if let Err(err) = settled {
            tracing::warn!(event_name, error = %err, "failed to settle delivery");
        }
    }

    async fn process(&self, event_name: &str, payload: &[u8]) -> EventBusResult<()> {
        let (subscriptions, descriptor) = {
            let registry = self.registry();
            let subscriptions = registry.handlers_for_event(event_name)?.to_vec();
            let descriptor = registry.event_type_by_name(event_name).copied().ok_or_else(|| {
                EventBusError::SubscriptionNotFound {
                    event_name: event_name.to_string(),
                }
            })?;
            (subscriptions, descriptor)
        };

        let event = descriptor.decode(payload)?;
        let scope = self.resolver.begin_scope();
        for subscription in &subscriptions {
            self.invoke(subscription, scope.as_ref(), event.as_ref())
                .await?;
        }
        Ok(())
    }

    async fn invoke(
        &self,
        subscription: &SubscriptionInfo,
        scope: &dyn HandlerScope,
        event: &(dyn Any + Send + Sync),
    ) -> EventBusResult<()> {
        let Some(timeout) = self.handler_timeout else {
            return subscription.invoke(scope, event).await;
        };
        tokio::time::timeout(timeout, subscription.invoke(scope, event))
            .await
            .map_err(|_| EventBusError::HandlerTimeout {
                handler: subscription.handler().type_name().to_string(),
                timeout,
            })?
    }
}
