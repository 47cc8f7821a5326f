//! 手写的多订阅者变更广播。
//!
//! # 教案级导览
//!
//! - **Why**：每个订阅者必须看到与写入提交次序一致的全序变更视图，
//!   且慢订阅者不得阻塞写入热路径。
//! - **How**：每个订阅者持有自己的有界通道；发射端逐一 `try_send`。
//!   通道打满与协议发送失败适用同一套僵尸纪律：先标记，下一轮发射
//!   开始时清出广播集。
//! - **What**：投递语义为逐订阅者至少一次；发射端永不挂起。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::tracking::change::PropertyChange;

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<PropertyChange>,
    zombie: bool,
}

/// 变更广播枢纽。
pub struct ChangeHub {
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_id: AtomicU64,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 注册一个订阅者，返回其接收端。`capacity` 是订阅者通道容量。
    pub fn subscribe(&self, capacity: usize) -> ChangeSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(SubscriberSlot {
            id,
            tx,
            zombie: false,
        });
        ChangeSubscription { id, rx }
    }

    /// 当前存活订阅者数量。
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|s| !s.zombie).count()
    }

    /// 向所有订阅者发射一条变更；满通道或已关闭的订阅者被标记为僵尸，
    /// 在下一次发射开始时移出广播集。
    pub fn emit(&self, change: &PropertyChange) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|slot| !slot.zombie && !slot.tx.is_closed());
        for slot in subscribers.iter_mut() {
            match slot.tx.try_send(change.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.zombie = true;
                    tracing::warn!(
                        target: "weave.tracking.stream",
                        subscriber = slot.id,
                        "change subscriber queue full, marking zombie"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slot.zombie = true;
                }
            }
        }
    }
}

/// 一个订阅者的接收端。
pub struct ChangeSubscription {
    id: u64,
    rx: mpsc::Receiver<PropertyChange>,
}

impl ChangeSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 等待下一条变更；枢纽侧被清理（僵尸）或枢纽销毁后返回 `None`。
    pub async fn recv(&mut self) -> Option<PropertyChange> {
        self.rx.recv().await
    }

    /// 非阻塞尝试取一条变更。
    pub fn try_recv(&mut self) -> Option<PropertyChange> {
        self.rx.try_recv().ok()
    }
}
