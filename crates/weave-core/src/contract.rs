use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 取消原语，统一表达挂起操作的可中断性契约。
///
/// # 设计背景（Why）
/// - 变更队列处理器与协议桥的所有挂起点都必须能被宿主生命周期主动打断，
///   避免关停时滞留重试循环或半开连接。
/// - 核心图操作（拦截、登记、派生重算）不挂起，因此取消语义只约束 I/O 面。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享。
/// - `cancel` 在首次成功设置取消位时返回 `true`，重复调用返回 `false`，
///   提示调用方避免重复执行兜底逻辑。
/// - `child` 派生共享同一原子位的实例，便于向队列处理器与连接任务传播。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需参数，默认处于“未取消”状态。
/// - **后置条件**：一旦 `cancel` 成功，`is_cancelled` 全局可见；挂起操作应在
///   下一个轮询点尽快退出，待发缓冲按“关停即丢弃”策略处理。
///
/// # 设计取舍与风险（Trade-offs）
/// - 未提供回调注册接口；挂起操作以定时轮询观察取消位，响应存在毫秒级延迟。
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
}

impl Cancellation {
    /// 创建处于“未取消”状态的取消令牌。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将当前令牌标记为取消。
    ///
    /// 返回 `true` 表示本次调用首次触发取消；`false` 表示此前已被取消。
    pub fn cancel(&self) -> bool {
        self.inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 派生共享同一原子位的子令牌。
    pub fn child(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// 跨线程可见性：子令牌持有方必须观察到父方发出的取消信号。
    #[test]
    fn cancellation_cross_thread_visibility() {
        let root = Cancellation::new();
        let token = root.child();
        let worker = thread::spawn(move || {
            while !token.is_cancelled() {
                thread::yield_now();
            }
        });
        assert!(root.cancel(), "首次取消应返回 true");
        worker.join().expect("工作线程必须观测到取消并退出");
        assert!(!root.cancel(), "重复取消应返回 false");
    }
}
