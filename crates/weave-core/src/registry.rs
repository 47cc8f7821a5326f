//! 主体登记簿：可达主体索引、双向父子簿记与路径寻址。
//!
//! # 教案级导览
//!
//! - **Why**：引用计数映射是登记簿成员资格的唯一事实来源；父/子列表必须
//!   双向一致，任何一侧单独漂移都是缺陷。
//! - **How**：单写多读纪律 —— 写者（连边/断边、挂接根）持排他锁，读者拿
//!   一致性快照。连边/断边是幂等原语，越过 0/1 边界时向生命周期引擎上报
//!   转变，事件结算在锁外进行。
//! - **What**：`len`/`contains`/`known_subjects` 只暴露计数 ≥ 1 的主体；
//!   计数为 0 但仍有出边的来源（未挂接的父方）以影子记录存在，不对外可见。

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::lifecycle;
use crate::subject::{PropertyRef, PropertySpec, SubjectHandle, SubjectId};
use crate::value::ContainerSlot;

use std::sync::Arc;

/// 一条入边：`(拥有属性, 槽位)`。
#[derive(Clone, Debug)]
pub struct ParentEdge {
    pub property: PropertyRef,
    pub slot: ContainerSlot,
}

/// 一条出边：`(子主体, 槽位)`。
#[derive(Clone, Debug)]
pub struct ChildEdge {
    pub subject: SubjectHandle,
    pub slot: ContainerSlot,
}

struct SubjectRecord {
    handle: SubjectHandle,
    ref_count: usize,
    explicit_root: bool,
    parents: Vec<ParentEdge>,
    children: HashMap<String, Vec<ChildEdge>>,
}

impl SubjectRecord {
    fn new(handle: SubjectHandle) -> Self {
        Self {
            handle,
            ref_count: 0,
            explicit_root: false,
            parents: Vec::new(),
            children: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.ref_count == 0
            && !self.explicit_root
            && self.parents.is_empty()
            && self.children.values().all(|edges| edges.is_empty())
    }
}

/// 已登记属性的快照视图。
#[derive(Clone, Debug)]
pub struct RegisteredProperty {
    pub spec: Arc<PropertySpec>,
    pub children: Vec<ChildEdge>,
}

/// 已登记主体的快照视图：身份、父列表与全部（静态 + 动态）已登记属性。
#[derive(Clone, Debug)]
pub struct RegisteredSubject {
    pub handle: SubjectHandle,
    pub ref_count: usize,
    pub parents: Vec<ParentEdge>,
    pub properties: Vec<RegisteredProperty>,
}

/// 主体登记簿。
pub struct SubjectRegistry {
    state: RwLock<HashMap<SubjectId, SubjectRecord>>,
}

impl Default for SubjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
        }
    }

    /// 登记簿当前包含的主体数（计数 ≥ 1）。
    pub fn len(&self) -> usize {
        self.state.read().values().filter(|r| r.ref_count > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 主体是否在登记簿中。
    pub fn contains(&self, subject: &SubjectHandle) -> bool {
        self.state
            .read()
            .get(&subject.id())
            .is_some_and(|r| r.ref_count > 0)
    }

    /// 主体当前引用计数（入边数 + 显式根加成）。
    pub fn ref_count(&self, subject: &SubjectHandle) -> usize {
        self.state
            .read()
            .get(&subject.id())
            .map(|r| r.ref_count)
            .unwrap_or(0)
    }

    /// 所有已登记主体的一致性快照。
    pub fn known_subjects(&self) -> Vec<RegisteredSubject> {
        let state = self.state.read();
        state
            .values()
            .filter(|r| r.ref_count > 0)
            .map(|r| snapshot_record(r))
            .collect()
    }

    /// 单个主体的登记快照。
    pub fn registered(&self, subject: &SubjectHandle) -> Option<RegisteredSubject> {
        let state = self.state.read();
        state
            .get(&subject.id())
            .filter(|r| r.ref_count > 0)
            .map(|r| snapshot_record(r))
    }

    /// 连一条 `属性 → 子主体` 边；幂等（重复连边不计数）。
    ///
    /// 计数 0→1 时向当前生命周期帧上报挂接转变；事件在帧提交时结算。
    pub(crate) fn link(&self, prop: &PropertyRef, slot: ContainerSlot, target: &SubjectHandle) {
        let became_attached = {
            let mut state = self.state.write();
            let target_record = state
                .entry(target.id())
                .or_insert_with(|| SubjectRecord::new(target.clone()));
            let already = target_record.parents.iter().any(|edge| {
                edge.property.subject().id() == prop.subject().id()
                    && edge.property.name() == prop.name()
                    && edge.slot == slot
            });
            if already {
                return;
            }
            target_record.parents.push(ParentEdge {
                property: prop.clone(),
                slot: slot.clone(),
            });
            target_record.ref_count += 1;
            let became = target_record.ref_count == 1;

            let source_record = state
                .entry(prop.subject().id())
                .or_insert_with(|| SubjectRecord::new(prop.subject().clone()));
            let edges = source_record
                .children
                .entry(prop.name().to_owned())
                .or_default();
            edges.push(ChildEdge {
                subject: target.clone(),
                slot,
            });
            edges.sort_by(|a, b| slot_order(&a.slot).cmp(&slot_order(&b.slot)));
            became
        };
        if became_attached {
            lifecycle::note_attached(target, Some(prop.subject()));
        }
    }

    /// 断一条 `属性 → 子主体` 边；幂等（不存在的边不减计数）。
    ///
    /// 计数 1→0 时向当前生命周期帧上报解挂转变。
    pub(crate) fn unlink(&self, prop: &PropertyRef, slot: &ContainerSlot, target: &SubjectHandle) {
        let became_detached = {
            let mut state = self.state.write();
            let Some(target_record) = state.get_mut(&target.id()) else {
                return;
            };
            let before = target_record.parents.len();
            target_record.parents.retain(|edge| {
                !(edge.property.subject().id() == prop.subject().id()
                    && edge.property.name() == prop.name()
                    && edge.slot == *slot)
            });
            if target_record.parents.len() == before {
                return;
            }
            target_record.ref_count -= 1;
            let became = target_record.ref_count == 0;
            if target_record.is_empty() {
                state.remove(&target.id());
            }

            if let Some(source_record) = state.get_mut(&prop.subject().id()) {
                if let Some(edges) = source_record.children.get_mut(prop.name()) {
                    if let Some(pos) = edges
                        .iter()
                        .position(|edge| edge.subject == *target && edge.slot == *slot)
                    {
                        edges.remove(pos);
                    }
                }
                if source_record.is_empty() {
                    state.remove(&prop.subject().id());
                }
            }
            became
        };
        if became_detached {
            lifecycle::note_detached(target, Some(prop.subject()));
        }
    }

    /// 将主体标记为显式根（计数 +1）；已是根时为幂等空操作。
    pub(crate) fn attach_root(&self, subject: &SubjectHandle) {
        let became_attached = {
            let mut state = self.state.write();
            let record = state
                .entry(subject.id())
                .or_insert_with(|| SubjectRecord::new(subject.clone()));
            if record.explicit_root {
                return;
            }
            record.explicit_root = true;
            record.ref_count += 1;
            record.ref_count == 1
        };
        if became_attached {
            lifecycle::note_attached(subject, None);
        }
    }

    /// 撤销显式根标记（计数 -1）。
    pub(crate) fn detach_root(&self, subject: &SubjectHandle) {
        let became_detached = {
            let mut state = self.state.write();
            let Some(record) = state.get_mut(&subject.id()) else {
                return;
            };
            if !record.explicit_root {
                return;
            }
            record.explicit_root = false;
            record.ref_count -= 1;
            let became = record.ref_count == 0;
            if record.is_empty() {
                state.remove(&subject.id());
            }
            became
        };
        if became_detached {
            lifecycle::note_detached(subject, None);
        }
    }

    /// 主体当前登记的全部出边，供解挂级联使用。
    pub(crate) fn out_edges(
        &self,
        subject: &SubjectHandle,
    ) -> Vec<(String, ContainerSlot, SubjectHandle)> {
        let state = self.state.read();
        let Some(record) = state.get(&subject.id()) else {
            return Vec::new();
        };
        record
            .children
            .iter()
            .flat_map(|(name, edges)| {
                edges
                    .iter()
                    .map(|edge| (name.clone(), edge.slot.clone(), edge.subject.clone()))
            })
            .collect()
    }

    /// 属性的规范点分路径：camelCase 名称、序列下标 `[i]`、映射键 `[k]`、
    /// 特性后缀 `@attr`（特性完整名即 `base@attr`，随普通拼接自然成形）。
    ///
    /// 主体不可达（或父链成环且无根）时返回 `None`。
    pub fn path_of(&self, prop: &PropertyRef) -> Option<String> {
        let state = self.state.read();
        let mut visited = Vec::new();
        let base = subject_path(&state, prop.subject(), &mut visited)?;
        if base.is_empty() {
            Some(prop.name().to_owned())
        } else {
            Some(format!("{base}.{}", prop.name()))
        }
    }

    /// 自 `root` 出发的环安全属性遍历：`(路径, 属性引用)` 列表。
    pub fn all_properties(&self, root: &SubjectHandle) -> Vec<(String, PropertyRef)> {
        let mut out = Vec::new();
        let mut visited = Vec::new();
        self.collect_properties(root, String::new(), &mut visited, &mut out);
        out
    }

    fn collect_properties(
        &self,
        subject: &SubjectHandle,
        prefix: String,
        visited: &mut Vec<SubjectId>,
        out: &mut Vec<(String, PropertyRef)>,
    ) {
        if visited.contains(&subject.id()) {
            return;
        }
        visited.push(subject.id());
        for spec in subject.properties() {
            let path = if prefix.is_empty() {
                spec.name().to_owned()
            } else {
                format!("{prefix}.{}", spec.name())
            };
            out.push((path.clone(), PropertyRef::new(subject.clone(), spec.name())));
            let children = {
                let state = self.state.read();
                state
                    .get(&subject.id())
                    .and_then(|r| r.children.get(spec.name()))
                    .cloned()
                    .unwrap_or_default()
            };
            for edge in children {
                let child_prefix = format!("{path}{}", edge.slot.path_suffix());
                self.collect_properties(&edge.subject, child_prefix, visited, out);
            }
        }
    }
}

fn snapshot_record(record: &SubjectRecord) -> RegisteredSubject {
    let properties = record
        .handle
        .properties()
        .into_iter()
        .map(|spec| RegisteredProperty {
            children: record
                .children
                .get(spec.name())
                .cloned()
                .unwrap_or_default(),
            spec,
        })
        .collect();
    RegisteredSubject {
        handle: record.handle.clone(),
        ref_count: record.ref_count,
        parents: record.parents.clone(),
        properties,
    }
}

fn slot_order(slot: &ContainerSlot) -> (u8, usize, &str) {
    match slot {
        ContainerSlot::Direct => (0, 0, ""),
        ContainerSlot::Index(i) => (1, *i, ""),
        ContainerSlot::Key(k) => (2, 0, k.as_str()),
    }
}

fn subject_path(
    state: &HashMap<SubjectId, SubjectRecord>,
    subject: &SubjectHandle,
    visited: &mut Vec<SubjectId>,
) -> Option<String> {
    if visited.contains(&subject.id()) {
        return None;
    }
    visited.push(subject.id());
    let record = state.get(&subject.id())?;
    let Some(edge) = record.parents.first() else {
        return Some(String::new());
    };
    if record.explicit_root {
        return Some(String::new());
    }
    let parent = subject_path(state, edge.property.subject(), visited)?;
    let segment = format!("{}{}", edge.property.name(), edge.slot.path_suffix());
    if parent.is_empty() {
        Some(segment)
    } else {
        Some(format!("{parent}.{segment}"))
    }
}
