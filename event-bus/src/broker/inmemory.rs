//! 内存版 broker（InMemoryBroker）
//!
//! 满足 broker 端口协议的轻量实现，语义对齐 AMQP 的 direct 交换机：
//! - 路由键精确匹配绑定，`mandatory` 发布在无队列可达时返回 `Unroutable`；
//! - 手动确认，`nack(requeue)` 将消息放回队首并标记 `redelivered`；
//! - 通道级 prefetch，通道或连接关闭时未确认的投递回到队列；
//! - 故障注入：不可达、断开连接、阻塞信号、消费者回调失败。
//!
//! 典型用途：测试环境、示例与本地开发。不提供持久化。
//!
use super::{
    Acker, BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal, Delivery,
    MessageProperties,
};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;

/// 内存 broker 句柄，克隆后共享同一份状态
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    connect_attempts: usize,
    next_id: u64,
    next_delivery_tag: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    /// (exchange, routing_key) -> queues
    bindings: HashMap<(String, String), BTreeSet<String>>,
    connections: HashMap<u64, broadcast::Sender<ConnectionSignal>>,
    channels: HashMap<u64, ChannelState>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct Unacked {
    message: Message,
    channel_id: u64,
    consumer_tag: String,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    consumers: HashMap<String, ConsumerState>,
}

struct ConsumerState {
    queue: String,
    pending_error: Option<BrokerError>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    // --- 管理与故障注入 ---

    /// 预先声明 direct 交换机
    pub fn declare_exchange(&self, exchange: &str) {
        self.shared
            .mutate(|st| st.exchanges.insert(exchange.to_string()));
    }

    /// 预先声明队列
    pub fn declare_queue(&self, queue: &str) {
        self.shared.mutate(|st| {
            st.queues.entry(queue.to_string()).or_default();
        });
    }

    /// 预先建立绑定（交换机与队列不存在时一并声明）
    pub fn bind(&self, queue: &str, exchange: &str, routing_key: &str) {
        self.shared.mutate(|st| {
            st.exchanges.insert(exchange.to_string());
            st.queues.entry(queue.to_string()).or_default();
            st.bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default()
                .insert(queue.to_string());
        });
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock()
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .is_some_and(|queues| queues.contains(queue))
    }

    /// 就绪消息数；队列不存在时返回 `None`
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.ready.len())
    }

    /// 已投递未确认的消息数
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    /// 挂在 `queue` 上的消费者数；队列不存在时返回 `None`
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        let st = self.lock();
        st.queues.get(queue)?;
        Some(
            st.channels
                .values()
                .flat_map(|ch| ch.consumers.values())
                .filter(|c| c.queue == queue)
                .count(),
        )
    }

    /// 为 false 时新的连接请求返回 `Unreachable`
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// 模拟 broker 侧断开：关闭所有连接并发出 `Shutdown` 信号
    pub fn drop_connections(&self, reason: &str) {
        let senders = self.shared.mutate(|st| {
            let ids: Vec<u64> = st.connections.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| st.close_connection(id))
                .collect::<Vec<_>>()
        });
        for tx in senders {
            let _ = tx.send(ConnectionSignal::Shutdown {
                reason: reason.to_string(),
            });
        }
    }

    /// 向所有连接发出 `Blocked` 信号，连接保持打开
    pub fn block_connections(&self, reason: &str) {
        let senders: Vec<_> = self.lock().connections.values().cloned().collect();
        for tx in senders {
            let _ = tx.send(ConnectionSignal::Blocked {
                reason: reason.to_string(),
            });
        }
    }

    /// 让 `queue` 上的每个消费者流产出一次错误（模拟通道回调失败）
    pub fn fail_consumers(&self, queue: &str, reason: &str) {
        self.shared.mutate(|st| {
            for channel in st.channels.values_mut() {
                for consumer in channel.consumers.values_mut() {
                    if consumer.queue == queue {
                        consumer.pending_error = Some(BrokerError::Protocol {
                            reason: reason.to_string(),
                        });
                    }
                }
            }
        });
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 修改状态后唤醒所有等待投递的消费者
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = {
            let mut state = self.lock();
            f(&mut state)
        };
        self.notify.notify_waiters();
        result
    }
}

impl State {
    fn channel_mut(&mut self, channel_id: u64) -> BrokerResult<&mut ChannelState> {
        self.channels
            .get_mut(&channel_id)
            .ok_or_else(|| BrokerError::ChannelClosed {
                reason: format!("channel {channel_id} is closed"),
            })
    }

    fn queue_mut(&mut self, queue: &str) -> BrokerResult<&mut Queue> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound {
                reason: format!("no queue '{queue}'"),
            })
    }

    fn close_connection(&mut self, connection_id: u64) -> Option<broadcast::Sender<ConnectionSignal>> {
        let tx = self.connections.remove(&connection_id)?;
        let channel_ids: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for id in channel_ids {
            self.close_channel(id);
        }
        Some(tx)
    }

    /// 关闭通道，其未确认投递按原顺序回到队首
    fn close_channel(&mut self, channel_id: u64) {
        if self.channels.remove(&channel_id).is_none() {
            return;
        }
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, mandatory: bool, message: Message) -> BrokerResult<()> {
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::NotFound {
                reason: format!("no exchange '{exchange}'"),
            });
        }
        let targets: Vec<String> = self
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        if targets.is_empty() {
            if mandatory {
                return Err(BrokerError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            return Ok(());
        }
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut st = self.lock();
        st.connect_attempts += 1;
        if st.unreachable {
            return Err(BrokerError::Unreachable {
                reason: "in-memory broker is unreachable".to_string(),
            });
        }
        st.next_id += 1;
        let id = st.next_id;
        let (tx, _rx) = broadcast::channel(16);
        st.connections.insert(id, tx.clone());
        tracing::debug!(connection_id = id, "in-memory connection opened");

        Ok(Arc::new(InMemoryConnection {
            id,
            shared: self.shared.clone(),
            signals: tx,
        }))
    }
}

struct InMemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    signals: broadcast::Sender<ConnectionSignal>,
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.lock().connections.contains_key(&self.id)
    }

    fn signals(&self) -> BoxStream<'static, ConnectionSignal> {
        BroadcastStream::new(self.signals.subscribe())
            .filter_map(|r| async move { r.ok() })
            .boxed()
    }

    async fn create_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let mut st = self.shared.lock();
        if !st.connections.contains_key(&self.id) {
            return Err(BrokerError::ConnectionClosed);
        }
        st.next_id += 1;
        let channel_id = st.next_id;
        st.channels.insert(
            channel_id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                consumers: HashMap::new(),
            },
        );

        Ok(Box::new(InMemoryChannel {
            id: channel_id,
            shared: self.shared.clone(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Some(tx) = self.shared.mutate(|st| st.close_connection(self.id)) {
            let _ = tx.send(ConnectionSignal::Shutdown {
                reason: "closed by application".to_string(),
            });
        }
        Ok(())
    }
}

struct InMemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn exchange_declare(&self, exchange: &str, _durable: bool) -> BrokerResult<()> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            st.exchanges.insert(exchange.to_string());
            Ok(())
        })
    }

    async fn queue_declare(&self, queue: &str, _durable: bool) -> BrokerResult<u32> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            let q = st.queues.entry(queue.to_string()).or_default();
            Ok(q.ready.len() as u32)
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            st.queue_mut(queue)?;
            if !st.exchanges.contains(exchange) {
                return Err(BrokerError::NotFound {
                    reason: format!("no exchange '{exchange}'"),
                });
            }
            st.bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default()
                .insert(queue.to_string());
            Ok(())
        })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            let key = (exchange.to_string(), routing_key.to_string());
            if let Some(queues) = st.bindings.get_mut(&key) {
                queues.remove(queue);
                if queues.is_empty() {
                    st.bindings.remove(&key);
                }
            }
            Ok(())
        })
    }

    async fn message_count(&self, queue: &str) -> BrokerResult<u32> {
        let mut st = self.shared.lock();
        st.channel_mut(self.id)?;
        Ok(st.queue_mut(queue)?.ready.len() as u32)
    }

    async fn queue_purge(&self, queue: &str) -> BrokerResult<u32> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            let q = st.queue_mut(queue)?;
            let purged = q.ready.len() as u32;
            q.ready.clear();
            Ok(purged)
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> BrokerResult<()> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?.prefetch = prefetch_count;
            Ok(())
        })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: MessageProperties,
        payload: &[u8],
    ) -> BrokerResult<()> {
        let message = Message {
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            properties,
            redelivered: false,
        };
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.channel_mut(self.id)?;
            st.route(exchange, routing_key, mandatory, message)
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, BrokerResult<Delivery>>> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            st.queue_mut(queue)?;
            let channel = st.channel_mut(self.id)?;
            channel.consumers.insert(
                consumer_tag.to_string(),
                ConsumerState {
                    queue: queue.to_string(),
                    pending_error: None,
                },
            );
            Ok(())
        })?;

        let cursor = ConsumerCursor {
            shared: self.shared.clone(),
            channel_id: self.id,
            consumer_tag: consumer_tag.to_string(),
            queue: queue.to_string(),
        };
        Ok(stream::unfold(cursor, |cursor| async move {
            let item = cursor.next_delivery().await?;
            Some((item, cursor))
        })
        .boxed())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shared.mutate(|st| st.close_channel(self.id));
        Ok(())
    }
}

struct ConsumerCursor {
    shared: Arc<Shared>,
    channel_id: u64,
    consumer_tag: String,
    queue: String,
}

enum Poll {
    Ready(Option<BrokerResult<Delivery>>),
    Pending,
}

impl ConsumerCursor {
    async fn next_delivery(&self) -> Option<BrokerResult<Delivery>> {
        // 每次投递前让出一次执行权：重新入队的消息会立即可取，否则接收循环在单次 poll 内空转
        tokio::task::yield_now().await;
        loop {
            // 先登记唤醒再检查状态，避免错过检查与等待之间的 notify_waiters
            let notified = self.shared.notify.notified();
            match self.poll() {
                Poll::Ready(item) => return item,
                Poll::Pending => notified.await,
            }
        }
    }

    fn poll(&self) -> Poll {
        let mut guard = self.shared.lock();
        let st = &mut *guard;

        let Some(channel) = st.channels.get_mut(&self.channel_id) else {
            return Poll::Ready(None);
        };
        let prefetch = channel.prefetch;
        let Some(consumer) = channel.consumers.get_mut(&self.consumer_tag) else {
            return Poll::Ready(None);
        };
        if let Some(err) = consumer.pending_error.take() {
            return Poll::Ready(Some(Err(err)));
        }

        let Some(queue) = st.queues.get_mut(&self.queue) else {
            return Poll::Ready(None);
        };
        let in_flight = queue
            .unacked
            .values()
            .filter(|u| u.channel_id == self.channel_id && u.consumer_tag == self.consumer_tag)
            .count();
        if prefetch > 0 && in_flight >= prefetch as usize {
            return Poll::Pending;
        }
        let Some(message) = queue.ready.pop_front() else {
            return Poll::Pending;
        };

        st.next_delivery_tag += 1;
        let tag = st.next_delivery_tag;
        let delivery = Delivery::new(
            tag,
            message.routing_key.clone(),
            message.payload.clone(),
            message.redelivered,
            message.properties.clone(),
            Box::new(InMemoryAcker {
                shared: self.shared.clone(),
                queue: self.queue.clone(),
                delivery_tag: tag,
            }),
        );
        queue.unacked.insert(
            tag,
            Unacked {
                message,
                channel_id: self.channel_id,
                consumer_tag: self.consumer_tag.clone(),
            },
        );

        Poll::Ready(Some(Ok(delivery)))
    }
}

struct InMemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    delivery_tag: u64,
}

impl InMemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> BrokerResult<()> {
        self.shared.mutate(|st| -> BrokerResult<_> {
            let queue = st.queue_mut(&self.queue)?;
            let unacked = queue
                .unacked
                .remove(&self.delivery_tag)
                .ok_or_else(|| BrokerError::Protocol {
                    reason: format!("unknown delivery tag {}", self.delivery_tag),
                })?;
            if requeue == Some(true) {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.settle(Some(requeue))
    }
}
