//! 持久连接（PersistentConnection）
//!
//! 独占到 broker 的唯一物理连接，并在瞬时故障后自动恢复：
//! - `try_connect` 在同一把锁下按重试策略建立连接，重试耗尽时返回 false 而不是报错；
//! - 每次连上后监听连接信号（关闭、阻塞、回调异常），信号经内部通道交给后台监督任务，
//!   由它再次执行 `try_connect`；
//! - `dispose` 之后不再重连。
//!
//! 通道廉价且不缓存，每次 `create_channel` 都从当前连接新建。
//!
use crate::broker::{BrokerChannel, BrokerConnection, BrokerConnector, ConnectionSignal};
use crate::error::{EventBusError, EventBusResult};
use crate::retry::{RetryError, RetryPolicy};
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 可克隆的连接管理器句柄
///
/// 构造时会启动后台监督任务，必须在 tokio 运行时内调用 `new`。
#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    retry: RetryPolicy,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    // 同一时刻只允许一个连接/重连过程
    connect_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
    token: CancellationToken,
    watcher: Mutex<Option<CancellationToken>>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
}

impl PersistentConnection {
    pub fn new(connector: Arc<dyn BrokerConnector>, retry: RetryPolicy) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let inner = Arc::new(Inner {
            connector,
            retry,
            connection: RwLock::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
            token: token.clone(),
            watcher: Mutex::new(None),
            signal_tx,
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), token, signal_rx));

        Self { inner }
    }

    /// 建立（或替换）连接；重试耗尽或已释放时返回 false
    pub async fn try_connect(&self) -> bool {
        self.inner.connect(true).await
    }

    /// 仅在当前没有可用连接时才连接
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        self.inner.connect(false).await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current().is_some()
    }

    /// 在当前连接上新建通道；无可用连接时返回 `InvalidState`
    pub async fn create_channel(&self) -> EventBusResult<Box<dyn BrokerChannel>> {
        let connection = self.inner.current().ok_or_else(|| {
            EventBusError::invalid_state("no broker connection is available to perform this action")
        })?;
        Ok(connection.create_channel().await?)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// 释放连接；可重复调用，关闭时的 I/O 错误只记录日志
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.token.cancel();

        let connection = self.inner.slot_mut().take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                tracing::warn!(error = %err, "failed to close broker connection on dispose");
            }
        }
        tracing::info!("broker connection disposed");
    }
}

impl Inner {
    fn slot_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn BrokerConnection>>> {
        self.connection
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 可用连接：存在、打开且未释放
    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        if self.disposed.load(Ordering::SeqCst) {
            return None;
        }
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_open())
            .cloned()
    }

    async fn connect(&self, force: bool) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        if !force && self.current().is_some() {
            return true;
        }

        tracing::info!("connecting to broker");
        let attempt = self.retry.run("connect", || self.connector.connect());
        let outcome = tokio::select! {
            _ = self.token.cancelled() => {
                tracing::debug!("connect abandoned, connection disposed");
                return false;
            }
            outcome = attempt => outcome,
        };
        let connection = match outcome {
            Ok(connection) => connection,
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::error!(attempts, error = %last, "could not connect to broker, retries exhausted");
                return false;
            }
            Err(RetryError::Permanent(err)) => {
                tracing::error!(error = %err, "could not connect to broker");
                return false;
            }
        };

        if self.disposed.load(Ordering::SeqCst) {
            let _ = connection.close().await;
            return false;
        }

        // 先停掉旧连接的信号监听，再关闭旧连接，避免旧连接的关闭信号触发新一轮重连
        self.watch(&connection);
        let previous = self.slot_mut().replace(connection);
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                tracing::debug!(error = %err, "previous broker connection closed with error");
            }
        }

        // dispose 可能发生在上面的检查与写入之间，写入后再确认一次
        if self.disposed.load(Ordering::SeqCst) {
            let stale = self.slot_mut().take();
            if let Some(stale) = stale {
                let _ = stale.close().await;
            }
            return false;
        }

        tracing::info!("broker connection established");
        self.current().is_some()
    }

    fn watch(&self, connection: &Arc<dyn BrokerConnection>) {
        let token = self.token.child_token();
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let mut signals = connection.signals();
        let tx = self.signal_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    signal = signals.next() => match signal {
                        Some(signal) => {
                            if tx.send(signal).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// 后台监督：收到连接信号即重连，已释放则忽略
async fn supervise(
    inner: Weak<Inner>,
    token: CancellationToken,
    mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
) {
    loop {
        let signal = tokio::select! {
            _ = token.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.disposed.load(Ordering::SeqCst) {
            continue;
        }

        tracing::warn!(%signal, "broker connection signal received, reconnecting");
        inner.connect(true).await;
    }
}
