//! 拦截管线：围绕每次属性读写的链式中间件。
//!
//! # 教案级导览
//!
//! - **Why**：等值闸门、校验、父子簿记、生命周期、变更发布与依赖记录都是
//!   围绕同一次读写的横切关注点；以有序链建模，各层保持独立可替换。
//! - **How**：链是 trait 对象数组，续延以“下标”形式传递（[`ReadNext`] /
//!   [`WriteNext`] 持有链切片与下一层下标），热路径上不为每次写入分配闭包。
//! - **What**：读拦截器必须恰好调用一次 `next`（或短路返回）；写拦截器至多
//!   以一个生效值调用一次 `next`。链最外层先进入，回卷时逆序收尾。

mod standard;

pub(crate) use standard::standard_chains;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::subject::PropertyRef;
use crate::value::PropertyValue;

/// 一次写入在链尾的落盘结果。
#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    /// 等值闸门判定存储值未变，链被短路，不产生任何下游副作用。
    Unchanged,
    /// 写入已提交；携带提交前后的存储值。
    Committed {
        old: PropertyValue,
        new: PropertyValue,
    },
}

/// 读拦截器：收到 `(属性引用, next)`，必须恰好调用一次 `next`，或短路返回。
pub trait ReadInterceptor: Send + Sync {
    fn read(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        next: ReadNext<'_>,
    ) -> Result<PropertyValue, CoreError>;
}

/// 写拦截器：收到 `(属性引用, 当前值, 提议值, next)`，
/// 至多以一个生效值调用一次 `next`。
pub trait WriteInterceptor: Send + Sync {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError>;
}

/// 读链续延：链切片 + 下一层下标。
pub struct ReadNext<'a> {
    chain: &'a [Arc<dyn ReadInterceptor>],
    index: usize,
}

impl<'a> ReadNext<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn ReadInterceptor>]) -> Self {
        Self { chain, index: 0 }
    }

    /// 推进到下一层；越过链尾时执行终端读取（存储槽或派生求值）。
    pub fn proceed(
        self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
    ) -> Result<PropertyValue, CoreError> {
        match self.chain.get(self.index) {
            Some(layer) => layer.read(
                ctx,
                prop,
                ReadNext {
                    chain: self.chain,
                    index: self.index + 1,
                },
            ),
            None => ctx.read_terminal(prop),
        }
    }
}

/// 写链续延：链切片 + 下一层下标。
pub struct WriteNext<'a> {
    chain: &'a [Arc<dyn WriteInterceptor>],
    index: usize,
}

impl<'a> WriteNext<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn WriteInterceptor>]) -> Self {
        Self { chain, index: 0 }
    }

    /// 以 `effective` 为生效值推进到下一层；越过链尾时落盘。
    pub fn proceed(
        self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        effective: PropertyValue,
    ) -> Result<WriteOutcome, CoreError> {
        match self.chain.get(self.index) {
            Some(layer) => layer.write(
                ctx,
                prop,
                current,
                effective,
                WriteNext {
                    chain: self.chain,
                    index: self.index + 1,
                },
            ),
            None => ctx.commit_terminal(prop, current, effective),
        }
    }
}

static NEXT_SET_ID: AtomicU64 = AtomicU64::new(1);

/// 一组成对注册的读/写拦截器，携带全局唯一 id。
///
/// id 用于集合并集时去重：同一套拦截器经多条挂接路径传播也只生效一次。
pub struct InterceptorSet {
    id: u64,
    reads: Vec<Arc<dyn ReadInterceptor>>,
    writes: Vec<Arc<dyn WriteInterceptor>>,
}

impl InterceptorSet {
    pub fn builder() -> InterceptorSetBuilder {
        InterceptorSetBuilder {
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reads(&self) -> &[Arc<dyn ReadInterceptor>] {
        &self.reads
    }

    pub fn writes(&self) -> &[Arc<dyn WriteInterceptor>] {
        &self.writes
    }
}

/// [`InterceptorSet`] 构建器。
pub struct InterceptorSetBuilder {
    reads: Vec<Arc<dyn ReadInterceptor>>,
    writes: Vec<Arc<dyn WriteInterceptor>>,
}

impl InterceptorSetBuilder {
    pub fn read(mut self, interceptor: Arc<dyn ReadInterceptor>) -> Self {
        self.reads.push(interceptor);
        self
    }

    pub fn write(mut self, interceptor: Arc<dyn WriteInterceptor>) -> Self {
        self.writes.push(interceptor);
        self
    }

    pub fn build(self) -> Arc<InterceptorSet> {
        Arc::new(InterceptorSet {
            id: NEXT_SET_ID.fetch_add(1, Ordering::Relaxed),
            reads: self.reads,
            writes: self.writes,
        })
    }
}

/// 主体持有的拦截器集合：自有集合与继承集合的有序并集。
///
/// # 契约说明（What）
/// - 子主体挂接到父主体时按并集继承父集合（引用计数首次到 1 时执行）；
///   解除挂接（计数归 0）时移除先前继承的集合。去重由集合 id 保证，
///   多路径挂接不会造成重复注册。
/// - 展平后的链快照缓存在 [`ArcSwap`] 中，读路径无锁取用。
pub struct InterceptorCollection {
    sets: RwLock<Vec<Arc<InterceptorSet>>>,
    flat_reads: ArcSwap<Vec<Arc<dyn ReadInterceptor>>>,
    flat_writes: ArcSwap<Vec<Arc<dyn WriteInterceptor>>>,
}

impl Default for InterceptorCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorCollection {
    pub fn new() -> Self {
        Self {
            sets: RwLock::new(Vec::new()),
            flat_reads: ArcSwap::from_pointee(Vec::new()),
            flat_writes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// 追加一个集合；id 已存在时为幂等空操作。
    pub fn add_set(&self, set: Arc<InterceptorSet>) {
        let mut sets = self.sets.write();
        if sets.iter().any(|s| s.id() == set.id()) {
            return;
        }
        sets.push(set);
        self.rebuild(&sets);
    }

    /// 按 id 移除一个集合。
    pub fn remove_set(&self, id: u64) {
        let mut sets = self.sets.write();
        let before = sets.len();
        sets.retain(|s| s.id() != id);
        if sets.len() != before {
            self.rebuild(&sets);
        }
    }

    /// 以并集方式继承另一集合当前的所有层。
    ///
    /// 自引用边会把主体自身当作父方传入，此时继承是恒等操作。
    pub fn inherit_from(&self, parent: &InterceptorCollection) {
        if std::ptr::eq(self, parent) {
            return;
        }
        let sets: Vec<Arc<InterceptorSet>> = parent.sets.read().clone();
        for set in sets {
            self.add_set(set);
        }
    }

    /// 移除先前从 `parent` 继承的所有层。
    pub fn disinherit(&self, parent: &InterceptorCollection) {
        if std::ptr::eq(self, parent) {
            return;
        }
        let parent_ids: Vec<u64> = parent.sets.read().iter().map(|s| s.id()).collect();
        for id in parent_ids {
            self.remove_set(id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// 当前展平的自定义读链快照。
    pub fn read_chain(&self) -> Arc<Vec<Arc<dyn ReadInterceptor>>> {
        self.flat_reads.load_full()
    }

    /// 当前展平的自定义写链快照。
    pub fn write_chain(&self) -> Arc<Vec<Arc<dyn WriteInterceptor>>> {
        self.flat_writes.load_full()
    }

    fn rebuild(&self, sets: &[Arc<InterceptorSet>]) {
        let reads = sets.iter().flat_map(|s| s.reads().iter().cloned()).collect();
        let writes = sets
            .iter()
            .flat_map(|s| s.writes().iter().cloned())
            .collect();
        self.flat_reads.store(Arc::new(reads));
        self.flat_writes.store(Arc::new(writes));
    }
}
