//! 事件总线
//!
//! - `on(kind, handler)` / `on_any(handler)` 注册同步回调，返回订阅 ID
//! - `off(id)` 注销
//! - `emit(event)` 同一事件名按注册顺序投递；回调 panic 被捕获并记录，
//!   不影响后续回调，也不会传播到调度器
//! - `subscribe()` 返回 broadcast 接收端，供异步消费者使用
//!
//! 投递发生在 emit 调用方的上下文中，emit 时不得持有队列状态锁

use super::{EventKind, QueueEvent};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, trace};

/// 广播通道容量
const BROADCAST_CAPACITY: usize = 1024;

/// 事件回调
pub type EventHandler = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// 订阅 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
}

struct BusInner {
    handlers: DashMap<EventKind, Vec<Subscription>>,
    any_handlers: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<QueueEvent>,
}

/// 事件总线（可克隆，克隆体共享同一组订阅）
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                handlers: DashMap::new(),
                any_handlers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                broadcast_tx,
            }),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// 订阅指定事件
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .handlers
            .entry(kind)
            .or_default()
            .push(Subscription {
                id,
                handler: Arc::new(handler),
            });
        id
    }

    /// 订阅全部事件（在指定事件的回调之后投递）
    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&QueueEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner.any_handlers.write().push(Subscription {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// 注销订阅
    ///
    /// # 返回
    /// 订阅是否存在
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for mut entry in self.inner.handlers.iter_mut() {
            let before = entry.len();
            entry.retain(|s| s.id != id);
            removed |= entry.len() != before;
        }
        let mut any = self.inner.any_handlers.write();
        let before = any.len();
        any.retain(|s| s.id != id);
        removed | (any.len() != before)
    }

    /// 异步订阅（广播接收端，落后过多时会收到 Lagged）
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// 发布事件
    pub fn emit(&self, event: QueueEvent) {
        let kind = event.kind();
        trace!("发布事件: {:?} file={:?}", kind, event.file_id());

        // 先复制回调列表再调用，回调内可以安全地 on/off
        let handlers: Vec<EventHandler> = self
            .inner
            .handlers
            .get(&kind)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();
        let any_handlers: Vec<EventHandler> = self
            .inner
            .any_handlers
            .read()
            .iter()
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers.iter().chain(any_handlers.iter()) {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(
                    "事件回调执行失败 ({:?}): {}",
                    kind,
                    panic_message(payload.as_ref())
                );
            }
        }

        // 没有异步订阅者时发送失败属于正常情况
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// 已注册的同步回调数量
    pub fn handler_count(&self) -> usize {
        let specific: usize = self.inner.handlers.iter().map(|e| e.len()).sum();
        specific + self.inner.any_handlers.read().len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
