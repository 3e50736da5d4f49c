//! 持久连接（PersistentConnection）
//!
//! 持有进程内唯一的共享中间件连接：
//! - `try_connect` 按重试策略建立连接，成功后订阅关闭/阻塞/回调异常通知以自动重连；
//! - 连接与重连互斥执行，并发调用方等待进行中的尝试结束；
//! - 旧连接的迟到通知按代次（generation）忽略，关闭后的通知一律忽略；
//! - 每次连接成功后通知 `on_connected` 监听器，供依赖方恢复自身状态；
//! - `close` 幂等，关闭失败只记录日志。
//!
use crate::retry::RetryPolicy;
use crate::transport::{
    BrokerConnection, BrokerListener, ConnectionFactory, SharedChannel, notify,
};
use eventbus::{EventBusError, EventBusResult as Result};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone)]
pub struct PersistentConnection {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn ConnectionFactory>,
    policy: RetryPolicy,
    sync_root: tokio::sync::Mutex<()>,
    slot: Mutex<Slot>,
    connected: Mutex<Vec<BrokerListener>>,
    disposed: AtomicBool,
}

#[derive(Default)]
struct Slot {
    connection: Option<Arc<dyn BrokerConnection>>,
    generation: u64,
    connecting: bool,
}

impl PersistentConnection {
    pub fn new(factory: Arc<dyn ConnectionFactory>, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                policy,
                sync_root: tokio::sync::Mutex::new(()),
                slot: Mutex::new(Slot::default()),
                connected: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// 存在打开的连接且未被关闭
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Connected
        } else if self.inner.slot().connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// 尝试建立连接，重试耗尽时返回 false
    pub async fn try_connect(&self) -> bool {
        let _guard = self.inner.sync_root.lock().await;
        if self.inner.is_connected() {
            return true;
        }
        self.inner.connect_locked().await
    }

    /// 未连接时尝试连接，失败返回 `Unavailable`
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() || self.try_connect().await {
            Ok(())
        } else {
            Err(EventBusError::unavailable(
                "no broker connection is available",
            ))
        }
    }

    /// 在共享连接上创建逻辑通道
    pub async fn create_channel(&self) -> Result<SharedChannel> {
        let connection = self
            .inner
            .current()
            .filter(|_| self.is_connected())
            .ok_or_else(|| {
                EventBusError::unavailable("no broker connection is available to create a channel")
            })?;
        connection.create_channel().await
    }

    /// 注册连接成功监听器，参数为端点；监听器在连接锁内同步调用，耗时工作应另起任务
    pub fn on_connected(&self, listener: BrokerListener) {
        self.inner
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// 关闭连接；重复调用无副作用
    pub async fn close(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = self.inner.slot().connection.take();
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                error!(error = %err, "failed to close broker connection");
            }
        }
        debug!("persistent connection closed");
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.slot().connection.clone()
    }

    fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.current().is_some_and(|c| c.is_open())
    }

    /// 调用方需持有 `sync_root`
    async fn connect_locked(self: &Arc<Self>) -> bool {
        if self.disposed.load(Ordering::SeqCst) {
            return false;
        }
        info!("broker client is trying to connect");
        self.slot().connecting = true;

        let result = self
            .policy
            .execute(
                || self.factory.connect(),
                |err, attempt, delay| {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "broker client could not connect after {:.1}s",
                        delay.as_secs_f64()
                    );
                },
            )
            .await
            .and_then(|conn| {
                if conn.is_open() {
                    Ok(conn)
                } else {
                    Err(EventBusError::broker_unreachable("connection closed on open"))
                }
            });

        self.slot().connecting = false;

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                error!(
                    endpoint = %self.factory.endpoint(),
                    error = %err,
                    "FATAL ERROR: broker connections could not be created and opened"
                );
                return false;
            }
        };

        if self.disposed.load(Ordering::SeqCst) {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "failed to close connection opened after close");
            }
            return false;
        }

        let (generation, previous) = {
            let mut slot = self.slot();
            slot.generation += 1;
            (slot.generation, slot.connection.replace(connection.clone()))
        };
        self.install_listeners(connection.as_ref(), generation);

        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!(error = %err, "failed to close replaced connection");
            }
        }

        info!(
            endpoint = %connection.endpoint(),
            generation,
            "broker client acquired a persistent connection and is subscribed to failure events"
        );

        let listeners = self
            .connected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        notify(&listeners, &connection.endpoint());
        true
    }

    fn install_listeners(self: &Arc<Self>, connection: &dyn BrokerConnection, generation: u64) {
        connection.on_shutdown(self.reconnect_listener("shutdown", generation));
        connection.on_blocked(self.reconnect_listener("blocked", generation));
        connection.on_callback_exception(self.reconnect_listener("callback exception", generation));
    }

    fn reconnect_listener(self: &Arc<Self>, kind: &'static str, generation: u64) -> BrokerListener {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = Handle::current();
        Arc::new(move |reason: &str| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            warn!(kind, reason, "broker connection {kind}, trying to re-connect");
            handle.spawn(inner.reconnect(generation));
        })
    }

    fn reconnect(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _guard = self.sync_root.lock().await;
            if self.disposed.load(Ordering::SeqCst) {
                return;
            }
            if self.slot().generation != generation {
                debug!(generation, "stale connection event ignored");
                return;
            }
            self.connect_locked().await;
        })
    }
}
