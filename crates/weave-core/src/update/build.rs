//! 快照构建：完整图快照与“由变更推导的部分快照”。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::subject::{SubjectHandle, SubjectId};
use crate::tracking::PropertyChange;
use crate::update::model::{PropertyUpdate, SubjectUpdate, UpdateValue};
use crate::value::{ContainerSlot, PropertyValue};

struct BuildState {
    ids: HashMap<SubjectId, String>,
    next_id: u64,
    queue: VecDeque<SubjectHandle>,
    serialized: HashSet<String>,
}

impl BuildState {
    fn new() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
            queue: VecDeque::new(),
            serialized: HashSet::new(),
        }
    }

    /// 为主体分配（或取回）本条更新内的 id；`enqueue` 时排队完整序列化。
    fn id_of(&mut self, subject: &SubjectHandle, enqueue: bool) -> String {
        if let Some(id) = self.ids.get(&subject.id()) {
            let id = id.clone();
            if enqueue && !self.serialized.contains(&id) {
                self.queue.push_back(subject.clone());
            }
            return id;
        }
        let id = self.next_id.to_string();
        self.next_id += 1;
        self.ids.insert(subject.id(), id.clone());
        if enqueue {
            self.queue.push_back(subject.clone());
        }
        id
    }
}

/// 构建自 `root` 可达子图的完整快照。
///
/// id 自 `"1"` 起按首次遇到的次序分配，仅在本条更新内稳定。
pub fn create_complete(
    ctx: &SubjectContext,
    root: &SubjectHandle,
) -> Result<SubjectUpdate, CoreError> {
    let mut state = BuildState::new();
    let root_id = state.id_of(root, true);
    let mut update = SubjectUpdate::new(root_id);
    drain_serialization_queue(ctx, &mut state, &mut update);
    Ok(update)
}

/// 由一批变更构建部分快照。
///
/// 每个变更主体连同“根到该主体的脊柱边”一起编码，接收方沿引用自根
/// 对账即可定位目标；变更值中引用的主体会被完整序列化。
/// 窗口内已离开登记簿的主体（根除外）被剪除。
pub fn create_partial_from_changes(
    ctx: &SubjectContext,
    root: &SubjectHandle,
    changes: &[PropertyChange],
) -> SubjectUpdate {
    let mut state = BuildState::new();
    let root_id = state.id_of(root, false);
    state.serialized.insert(root_id.clone());
    let mut update = SubjectUpdate::new(root_id);

    // 逐属性去重，保留最后观测值。
    let mut order: Vec<&PropertyChange> = Vec::new();
    let mut positions: HashMap<(SubjectId, String), usize> = HashMap::new();
    for change in changes {
        let key = (
            change.property().subject().id(),
            change.property().name().to_owned(),
        );
        match positions.get(&key) {
            Some(&pos) => order[pos] = change,
            None => {
                positions.insert(key, order.len());
                order.push(change);
            }
        }
    }

    for change in order {
        let subject = change.property().subject();
        if subject != root && !ctx.registry().contains(subject) {
            tracing::debug!(
                target: "weave.update",
                property = change.property().name(),
                "pruning change whose subject left the registry"
            );
            continue;
        }
        add_spine(ctx, root, subject, &mut state, &mut update);
        let sid = state.id_of(subject, false);
        state.serialized.insert(sid.clone());
        let encoded = encode_value(change.new_value(), &mut state);
        update
            .subjects
            .entry(sid)
            .or_default()
            .insert(change.property().name().to_owned(), PropertyUpdate::Value {
                value: encoded,
            });
    }

    drain_serialization_queue(ctx, &mut state, &mut update);
    update
}

fn drain_serialization_queue(
    ctx: &SubjectContext,
    state: &mut BuildState,
    update: &mut SubjectUpdate,
) {
    while let Some(subject) = state.queue.pop_front() {
        let sid = state.id_of(&subject, false);
        if !state.serialized.insert(sid.clone()) {
            continue;
        }
        let mut props = update.subjects.remove(&sid).unwrap_or_default();
        for spec in subject.properties() {
            if !spec.is_readable() {
                continue;
            }
            match ctx.read(&subject, spec.name()) {
                Ok(value) => {
                    let encoded = encode_value(&value, state);
                    props.insert(spec.name().to_owned(), PropertyUpdate::Value { value: encoded });
                }
                Err(err) => {
                    tracing::warn!(
                        target: "weave.update",
                        property = spec.name(),
                        error = %err,
                        "skipping unreadable property during snapshot"
                    );
                }
            }
        }
        update.subjects.insert(sid, props);
    }
}

fn encode_value(value: &PropertyValue, state: &mut BuildState) -> UpdateValue {
    match value {
        PropertyValue::Null => UpdateValue::Null,
        PropertyValue::Bool(v) => UpdateValue::Bool { value: *v },
        PropertyValue::Integer(v) => UpdateValue::Integer { value: *v },
        PropertyValue::Float(v) => UpdateValue::Float { value: *v },
        PropertyValue::Text(v) => UpdateValue::Text { value: v.clone() },
        PropertyValue::Subject(handle) => UpdateValue::Ref {
            id: state.id_of(handle, true),
        },
        PropertyValue::List(items) => UpdateValue::List {
            values: items.iter().map(|item| encode_value(item, state)).collect(),
        },
        PropertyValue::Map(entries) => UpdateValue::Map {
            entries: entries
                .iter()
                .map(|(key, item)| (key.clone(), encode_value(item, state)))
                .collect(),
        },
    }
}

/// 把“根 → 主体”的首父链编码为引用脊柱；已有的实际变更条目不被覆盖。
fn add_spine(
    ctx: &SubjectContext,
    root: &SubjectHandle,
    subject: &SubjectHandle,
    state: &mut BuildState,
    update: &mut SubjectUpdate,
) {
    let mut chain: Vec<(SubjectHandle, String, ContainerSlot, SubjectHandle)> = Vec::new();
    let mut cursor = subject.clone();
    let mut visited: Vec<SubjectId> = Vec::new();
    while cursor != *root {
        if visited.contains(&cursor.id()) {
            return;
        }
        visited.push(cursor.id());
        let Some(registered) = ctx.registry().registered(&cursor) else {
            return;
        };
        let Some(edge) = registered.parents.first().cloned() else {
            return;
        };
        let parent = edge.property.subject().clone();
        chain.push((
            parent.clone(),
            edge.property.name().to_owned(),
            edge.slot,
            cursor.clone(),
        ));
        cursor = parent;
    }
    for (parent, name, slot, child) in chain.into_iter().rev() {
        let parent_id = state.id_of(&parent, false);
        state.serialized.insert(parent_id.clone());
        let child_id = state.id_of(&child, false);
        state.serialized.insert(child_id.clone());
        let reference = UpdateValue::Ref { id: child_id };
        let entry = match slot {
            ContainerSlot::Direct => PropertyUpdate::Value { value: reference },
            ContainerSlot::Index(index) => PropertyUpdate::CollectionItem {
                index,
                value: reference,
            },
            ContainerSlot::Key(key) => PropertyUpdate::MapItem {
                key,
                value: reference,
            },
        };
        update
            .subjects
            .entry(parent_id)
            .or_default()
            .entry(name)
            .or_insert(entry);
    }
}
