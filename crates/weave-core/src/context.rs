//! 主体上下文：拦截链装配、写闸门、登记簿与变更流的聚合根。
//!
//! # 教案级导览
//!
//! - **Why**：等值闸门、落盘与变更发射必须构成单属性上的一个原子步骤；
//!   派生重算必须严格发生在触发写完成之后。上下文以一把可重入写闸门
//!   与一个待重算队列实现这两条时序约束。
//! - **How**：写路径持有上下文级可重入闸门（拦截器触发的嵌套写在同一
//!   线程上直接重入）；线程本地深度计数区分最外层写，仅最外层在闸门
//!   释放后排空重算队列。读路径不与无关读串行化。
//! - **What**：锁序为 `更新应用互斥 → 写闸门 → 登记簿 → 主体槽 → 变更枢纽`，
//!   任何路径不得逆序持有。

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, ReentrantMutex, RwLock};

use crate::error::CoreError;
use crate::interceptor::{
    ReadInterceptor, ReadNext, WriteInterceptor, WriteNext, WriteOutcome, standard_chains,
};
use crate::lifecycle::{self, LifecycleHandler};
use crate::registry::SubjectRegistry;
use crate::subject::{PropertyRef, PropertySpec, Reader, SubjectHandle, Writer};
use crate::tracking::derived::{self, DerivedIndex};
use crate::tracking::stream::{ChangeHub, ChangeSubscription};
use crate::tracking::{PropertyChange, current_source};
use crate::value::{PropertyValue, edge_diff};

thread_local! {
    static WRITE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard {
    root: bool,
}

impl DepthGuard {
    fn enter() -> Self {
        WRITE_DEPTH.with(|depth| {
            let current = depth.get();
            depth.set(current + 1);
            Self { root: current == 0 }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        WRITE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

struct ContextInner {
    registry: SubjectRegistry,
    hub: ChangeHub,
    derived: DerivedIndex,
    handlers: RwLock<Vec<Arc<dyn LifecycleHandler>>>,
    write_gate: ReentrantMutex<()>,
    apply_mutex: Mutex<()>,
    reads: Vec<Arc<dyn ReadInterceptor>>,
    write_outer: Vec<Arc<dyn WriteInterceptor>>,
    write_inner: Vec<Arc<dyn WriteInterceptor>>,
    write_full: Vec<Arc<dyn WriteInterceptor>>,
    pending: Mutex<VecDeque<PropertyRef>>,
}

/// 主体上下文。克隆即共享。
#[derive(Clone)]
pub struct SubjectContext {
    inner: Arc<ContextInner>,
}

impl Default for SubjectContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectContext {
    pub fn new() -> Self {
        let chains = standard_chains();
        let mut write_full = chains.write_outer.clone();
        write_full.extend(chains.write_inner.iter().cloned());
        Self {
            inner: Arc::new(ContextInner {
                registry: SubjectRegistry::new(),
                hub: ChangeHub::new(),
                derived: DerivedIndex::new(),
                handlers: RwLock::new(Vec::new()),
                write_gate: ReentrantMutex::new(()),
                apply_mutex: Mutex::new(()),
                reads: chains.reads,
                write_outer: chains.write_outer,
                write_inner: chains.write_inner,
                write_full,
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn registry(&self) -> &SubjectRegistry {
        &self.inner.registry
    }

    pub(crate) fn derived_index(&self) -> &DerivedIndex {
        &self.inner.derived
    }

    /// 订阅变更流；`capacity` 为该订阅者的有界通道容量。
    pub fn subscribe(&self, capacity: usize) -> ChangeSubscription {
        self.inner.hub.subscribe(capacity)
    }

    /// 注册生命周期回调。
    pub fn add_lifecycle_handler(&self, handler: Arc<dyn LifecycleHandler>) {
        self.inner.handlers.write().push(handler);
    }

    pub(crate) fn lifecycle_handlers(&self) -> Vec<Arc<dyn LifecycleHandler>> {
        self.inner.handlers.read().clone()
    }

    /// 将主体标记为显式根并结算由此产生的挂接事件。
    pub fn attach_root(&self, subject: &SubjectHandle) {
        lifecycle::begin_frame();
        self.inner.registry.attach_root(subject);
        lifecycle::commit_frame(self);
    }

    /// 撤销显式根标记并结算由此产生的解挂事件。
    pub fn detach_root(&self, subject: &SubjectHandle) {
        lifecycle::begin_frame();
        self.inner.registry.detach_root(subject);
        lifecycle::commit_frame(self);
    }

    /// 更新应用路径的整调用互斥；必须在写闸门之外获取，严禁逆序。
    pub(crate) fn apply_guard(&self) -> MutexGuard<'_, ()> {
        self.inner.apply_mutex.lock()
    }

    /// 在应用互斥的保护下执行 `f`。
    ///
    /// 桥在构建欢迎快照时借此与入站应用互斥，使快照与其携带的序号
    /// 在同一瞬间一致。
    pub fn with_apply_barrier<R>(&self, f: impl FnOnce() -> R) -> R {
        let _mutex = self.inner.apply_mutex.lock();
        f()
    }

    /// 经拦截链读取属性。
    pub fn read(&self, subject: &SubjectHandle, name: &str) -> Result<PropertyValue, CoreError> {
        let spec = self.resolve(subject, name)?;
        if !spec.is_readable() {
            return Err(CoreError::AccessDenied {
                property: name.to_owned(),
                direction: "readable",
            });
        }
        let prop = PropertyRef::new(subject.clone(), name);
        let custom = subject.interceptors().read_chain();
        if custom.is_empty() {
            ReadNext::new(&self.inner.reads).proceed(self, &prop)
        } else {
            let mut chain = self.inner.reads.clone();
            chain.extend(custom.iter().cloned());
            ReadNext::new(&chain).proceed(self, &prop)
        }
    }

    /// 经拦截链写入属性。
    ///
    /// 等值闸门、校验、落盘与变更发射在写闸门内构成原子步骤；
    /// 最外层写返回前排空派生重算队列。
    pub fn write(
        &self,
        subject: &SubjectHandle,
        name: &str,
        value: PropertyValue,
    ) -> Result<WriteOutcome, CoreError> {
        let spec = self.resolve(subject, name)?;
        if !spec.is_writable() {
            return Err(CoreError::AccessDenied {
                property: name.to_owned(),
                direction: "writable",
            });
        }
        if !value.conforms_to(spec.kind()) {
            return Err(CoreError::TypeMismatch {
                property: name.to_owned(),
                expected: spec.kind().name(),
                actual: value.kind().name(),
            });
        }
        let prop = PropertyRef::new(subject.clone(), name);
        let (result, root) = {
            let _gate = self.inner.write_gate.lock();
            let depth = DepthGuard::enter();
            let slot = subject.slot_of(name).ok_or_else(|| CoreError::UnknownProperty {
                property: name.to_owned(),
            });
            let result = slot.and_then(|slot| {
                let current = subject.storage_get(slot);
                let custom = subject.interceptors().write_chain();
                if custom.is_empty() {
                    WriteNext::new(&self.inner.write_full).proceed(self, &prop, &current, value)
                } else {
                    let mut chain = self.inner.write_outer.clone();
                    chain.extend(custom.iter().cloned());
                    chain.extend(self.inner.write_inner.iter().cloned());
                    WriteNext::new(&chain).proceed(self, &prop, &current, value)
                }
            });
            (result, depth.root)
        };
        // 嵌套写可能已经排入重算；无论本层成败，最外层都负责排空。
        if root {
            self.drain_recomputes();
        }
        result
    }

    /// 链尾的终端读取：存储槽直读或派生求值（含缓存与依赖重录）。
    pub(crate) fn read_terminal(&self, prop: &PropertyRef) -> Result<PropertyValue, CoreError> {
        let spec = self.resolve(prop.subject(), prop.name())?;
        let slot = prop
            .subject()
            .slot_of(prop.name())
            .ok_or_else(|| CoreError::UnknownProperty {
                property: prop.name().to_owned(),
            })?;
        match spec.reader() {
            Reader::None => Err(CoreError::AccessDenied {
                property: prop.name().to_owned(),
                direction: "readable",
            }),
            Reader::Stored => Ok(prop.subject().storage_get(slot)),
            Reader::Computed(compute) => {
                if self.inner.derived.is_valid(&prop.key()) {
                    return Ok(prop.subject().storage_get(slot));
                }
                let previous = prop.subject().storage_get(slot);
                let (value, reads) = derived::evaluate_raw(self, prop, compute)?;
                self.inner.derived.record(prop, &reads);
                prop.subject().storage_set(slot, value.clone());
                self.sync_value_edges(prop, &previous, &value);
                Ok(value)
            }
        }
    }

    /// 链尾的终端落盘：写入存储槽或执行自定义写穿。
    pub(crate) fn commit_terminal(
        &self,
        prop: &PropertyRef,
        current: &PropertyValue,
        effective: PropertyValue,
    ) -> Result<WriteOutcome, CoreError> {
        let spec = self.resolve(prop.subject(), prop.name())?;
        let slot = prop
            .subject()
            .slot_of(prop.name())
            .ok_or_else(|| CoreError::UnknownProperty {
                property: prop.name().to_owned(),
            })?;
        match spec.writer() {
            Writer::None => Err(CoreError::AccessDenied {
                property: prop.name().to_owned(),
                direction: "writable",
            }),
            Writer::Stored => {
                prop.subject().storage_set(slot, effective.clone());
                Ok(WriteOutcome::Committed {
                    old: current.clone(),
                    new: effective,
                })
            }
            Writer::Custom(write_through) => {
                write_through(self, prop.subject(), &effective)?;
                // 写穿底层状态后缓存不再可信；下一次读取重算并重录依赖。
                self.inner.derived.invalidate(&prop.key());
                Ok(WriteOutcome::Committed {
                    old: current.clone(),
                    new: effective,
                })
            }
        }
    }

    /// 发射变更记录并为受影响的派生属性排队重算。
    pub(crate) fn publish_change(
        &self,
        prop: &PropertyRef,
        old: PropertyValue,
        new: PropertyValue,
    ) {
        let change = PropertyChange::new(prop.clone(), old, new, current_source());
        self.inner.hub.emit(&change);
        let dependents = self.inner.derived.dependents_of(&prop.key());
        if !dependents.is_empty() {
            let mut pending = self.inner.pending.lock();
            for dependent in dependents {
                if !pending.iter().any(|p| p.key() == dependent.key()) {
                    pending.push_back(dependent);
                }
            }
        }
    }

    /// 在独立的生命周期帧内同步一次值替换产生的边差集。
    pub(crate) fn sync_value_edges(
        &self,
        prop: &PropertyRef,
        old: &PropertyValue,
        new: &PropertyValue,
    ) {
        let (gained, lost) = edge_diff(old, new);
        if gained.is_empty() && lost.is_empty() {
            return;
        }
        lifecycle::begin_frame();
        for (slot, subject) in gained {
            self.inner.registry.link(prop, slot, &subject);
        }
        for (slot, subject) in lost {
            self.inner.registry.unlink(prop, &slot, &subject);
        }
        lifecycle::commit_frame(self);
    }

    /// 运行时向主体追加动态属性（或属性特性）。
    ///
    /// 动态项是一等公民：与静态声明同样经过拦截管线、变更流与更新协议。
    pub fn add_dynamic_property(
        &self,
        subject: &SubjectHandle,
        spec: PropertySpec,
    ) -> Result<PropertyRef, CoreError> {
        if subject.spec_of(spec.name()).is_some() {
            return Err(CoreError::internal(format!(
                "property `{}` already declared on subject",
                spec.name()
            )));
        }
        if let Some((base, _)) = spec.attribute_of() {
            if subject.spec_of(base).is_none() {
                return Err(CoreError::UnknownProperty {
                    property: base.to_owned(),
                });
            }
        }
        let name = spec.name().to_owned();
        let spec = Arc::new(spec);
        subject.push_dynamic(spec.clone());
        if self.inner.registry.contains(subject) {
            for initializer in spec.initializers() {
                initializer(self, subject, &spec);
            }
        }
        Ok(PropertyRef::new(subject.clone(), &name))
    }

    fn resolve(
        &self,
        subject: &SubjectHandle,
        name: &str,
    ) -> Result<Arc<PropertySpec>, CoreError> {
        subject
            .spec_of(name)
            .ok_or_else(|| CoreError::UnknownProperty {
                property: name.to_owned(),
            })
    }

    fn drain_recomputes(&self) {
        loop {
            let next = self.inner.pending.lock().pop_front();
            let Some(prop) = next else { break };
            self.recompute(&prop);
        }
    }

    /// 重算一个派生属性：重新求值、整体替换依赖集，仅当缓存值改变时
    /// 同步边差并发射变更。重算严格发生在触发写完成之后。
    fn recompute(&self, prop: &PropertyRef) {
        let Some(spec) = prop.subject().spec_of(prop.name()) else {
            return;
        };
        let Reader::Computed(compute) = spec.reader().clone() else {
            return;
        };
        let Some(slot) = prop.subject().slot_of(prop.name()) else {
            return;
        };
        let _gate = self.inner.write_gate.lock();
        let old = prop.subject().storage_get(slot);
        self.inner.derived.invalidate(&prop.key());
        match derived::evaluate_raw(self, prop, &compute) {
            Ok((value, reads)) => {
                self.inner.derived.record(prop, &reads);
                prop.subject().storage_set(slot, value.clone());
                if value != old {
                    self.sync_value_edges(prop, &old, &value);
                    self.publish_change(prop, old, value);
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "weave.tracking.derived",
                    property = prop.name(),
                    error = %err,
                    "derived recomputation failed"
                );
            }
        }
    }
}
