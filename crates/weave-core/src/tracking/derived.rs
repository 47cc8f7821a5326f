//! 派生属性：依赖记录、失效与重算。
//!
//! # 教案级导览
//!
//! - **Why**：派生属性的依赖集必须等于“最近一次求值实际读到的属性集”。
//!   条件短路改变依赖集时，按实际读取重录即可自然收敛，无需静态声明。
//! - **How**：记录器是线程本地栈。求值前压入目标帧，求值期间读链最外层的
//!   依赖记录器把每个被读引用追加到栈顶帧；求值结束弹帧，以帧内容整体
//!   替换旧依赖集。
//! - **What**：重入栈上已有的派生属性即环，以
//!   [`CoreError::DerivationCycle`] 同步失败；记录器状态绝不跨线程共享。

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::subject::{ComputeFn, PropertyKey, PropertyRef, SubjectId};
use crate::value::PropertyValue;

struct Frame {
    target: PropertyKey,
    reads: Vec<PropertyRef>,
}

thread_local! {
    static RECORDING: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// 读链依赖记录器的落点：把被读引用追加进当前线程栈顶的记录帧。
pub(crate) fn record_read(prop: &PropertyRef) {
    RECORDING.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            let key = prop.key();
            if key != frame.target && !frame.reads.iter().any(|r| r.key() == key) {
                frame.reads.push(prop.clone());
            }
        }
    });
}

/// 执行一次派生求值并返回 `(值, 实际读到的依赖)`。
///
/// 重入栈上已有的目标即环，求值不会开始。
pub(crate) fn evaluate_raw(
    ctx: &SubjectContext,
    prop: &PropertyRef,
    compute: &Arc<ComputeFn>,
) -> Result<(PropertyValue, Vec<PropertyRef>), CoreError> {
    let key = prop.key();
    let cycle = RECORDING.with(|stack| stack.borrow().iter().any(|f| f.target == key));
    if cycle {
        return Err(CoreError::DerivationCycle {
            property: prop.name().to_owned(),
        });
    }
    RECORDING.with(|stack| {
        stack.borrow_mut().push(Frame {
            target: key,
            reads: Vec::new(),
        })
    });
    let result = compute(ctx, prop.subject());
    let frame = RECORDING
        .with(|stack| stack.borrow_mut().pop())
        .expect("recording frame must survive its own evaluation");
    let value = result?;
    Ok((value, frame.reads))
}

struct DerivedEntry {
    prop: PropertyRef,
    deps: Vec<PropertyKey>,
    valid: bool,
}

/// 派生属性索引：依赖正反向映射与缓存有效性。
pub struct DerivedIndex {
    state: Mutex<IndexState>,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<PropertyKey, DerivedEntry>,
    dependents: HashMap<PropertyKey, Vec<PropertyKey>>,
}

impl Default for DerivedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivedIndex {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
        }
    }

    /// 缓存是否仍然有效。
    pub(crate) fn is_valid(&self, key: &PropertyKey) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| entry.valid)
    }

    /// 使缓存失效；带 setter 的派生属性写穿后调用，下一次读取重算并重录依赖。
    pub(crate) fn invalidate(&self, key: &PropertyKey) {
        if let Some(entry) = self.state.lock().entries.get_mut(key) {
            entry.valid = false;
        }
    }

    /// 以本次求值实际读到的集合整体替换依赖集，并标记缓存有效。
    pub(crate) fn record(&self, prop: &PropertyRef, reads: &[PropertyRef]) {
        let key = prop.key();
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&key) {
            for dep in entry.deps {
                if let Some(list) = state.dependents.get_mut(&dep) {
                    list.retain(|k| *k != key);
                    if list.is_empty() {
                        state.dependents.remove(&dep);
                    }
                }
            }
        }
        let deps: Vec<PropertyKey> = reads.iter().map(|r| r.key()).collect();
        for dep in &deps {
            state.dependents.entry(dep.clone()).or_default().push(key.clone());
        }
        state.entries.insert(
            key,
            DerivedEntry {
                prop: prop.clone(),
                deps,
                valid: true,
            },
        );
    }

    /// 依赖 `key` 的派生属性集合。
    pub(crate) fn dependents_of(&self, key: &PropertyKey) -> Vec<PropertyRef> {
        let state = self.state.lock();
        state
            .dependents
            .get(key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| state.entries.get(k).map(|e| e.prop.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 主体解挂时清除其派生条目与反向引用。
    pub(crate) fn remove_subject(&self, subject: SubjectId) {
        let mut state = self.state.lock();
        let removed: Vec<PropertyKey> = state
            .entries
            .keys()
            .filter(|k| k.subject == subject)
            .cloned()
            .collect();
        for key in &removed {
            if let Some(entry) = state.entries.remove(key) {
                for dep in entry.deps {
                    if let Some(list) = state.dependents.get_mut(&dep) {
                        list.retain(|k| k != key);
                        if list.is_empty() {
                            state.dependents.remove(&dep);
                        }
                    }
                }
            }
        }
        state.dependents.retain(|dep, _| dep.subject != subject);
    }
}
