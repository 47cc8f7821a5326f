//! 快照应用：在接收方图上幂等地落实一条 [`SubjectUpdate`]。
//!
//! # 教案级导览
//!
//! - **Why**：应用必须整体互斥（同一接收图上不允许并发应用），且期间
//!   提交的变更要带上桥的来源标签，避免回声。
//! - **How**：持上下文的应用互斥贯穿整个调用（该互斥始终在写闸门之外
//!   获取）；来源标签经线程本地作用域守卫设置。主体按 id 对账：本地已
//!   存在的实例尽量复用（稳定引用存续），缺失时经注入的工厂构造。
//! - **What**：未知入站属性被忽略；类型不符记录日志后跳过该属性、继续
//!   应用其余部分；对同一更新应用两次与应用一次等价。

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::bridge::SubjectFactory;
use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::subject::{PropertySpec, SubjectHandle};
use crate::tracking::{SourceScope, SourceTag};
use crate::update::model::{PropertyUpdate, SubjectUpdate, UpdateValue};
use crate::value::{PropertyValue, ValueKind};

/// 应用选项：来源标签与主体工厂。
pub struct ApplyOptions<'a> {
    pub source: Option<SourceTag>,
    pub factory: Option<&'a dyn SubjectFactory>,
}

impl Default for ApplyOptions<'_> {
    fn default() -> Self {
        Self {
            source: None,
            factory: None,
        }
    }
}

struct ApplyState<'a> {
    resolved: HashMap<String, SubjectHandle>,
    applied: HashSet<String>,
    factory: Option<&'a dyn SubjectFactory>,
}

/// 在 `root` 锚定的图上应用一条更新。
pub fn apply(
    ctx: &SubjectContext,
    root: &SubjectHandle,
    update: &SubjectUpdate,
    options: ApplyOptions<'_>,
) -> Result<(), CoreError> {
    let _mutex = ctx.apply_guard();
    let _scope = options.source.clone().map(SourceScope::enter);
    let mut state = ApplyState {
        resolved: HashMap::from([(update.root.clone(), root.clone())]),
        applied: HashSet::new(),
        factory: options.factory,
    };
    apply_subject(ctx, update, &update.root, root, &mut state)
}

fn apply_subject(
    ctx: &SubjectContext,
    update: &SubjectUpdate,
    id: &str,
    subject: &SubjectHandle,
    state: &mut ApplyState<'_>,
) -> Result<(), CoreError> {
    if !state.applied.insert(id.to_owned()) {
        return Ok(());
    }
    let Some(props) = update.subjects.get(id) else {
        return Ok(());
    };
    for (name, prop_update) in props {
        let Some(spec) = subject.spec_of(name) else {
            tracing::debug!(
                target: "weave.update",
                property = name.as_str(),
                "ignoring unknown incoming property"
            );
            continue;
        };
        let result = apply_property(ctx, update, subject, &spec, prop_update, state);
        match result {
            Ok(()) => {}
            Err(CoreError::TypeMismatch {
                property,
                expected,
                actual,
            }) => {
                tracing::warn!(
                    target: "weave.update",
                    property = property.as_str(),
                    expected,
                    actual,
                    "type mismatch while applying update, property skipped"
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn apply_property(
    ctx: &SubjectContext,
    update: &SubjectUpdate,
    subject: &SubjectHandle,
    spec: &PropertySpec,
    prop_update: &PropertyUpdate,
    state: &mut ApplyState<'_>,
) -> Result<(), CoreError> {
    if !spec.is_writable() && !spec.is_derived() {
        return Ok(());
    }
    let name = spec.name();
    match prop_update {
        PropertyUpdate::Absence => {
            if spec.is_writable() {
                ctx.write(subject, name, PropertyValue::Null)?;
            }
            Ok(())
        }
        PropertyUpdate::Value { value } => {
            if !spec.is_writable() {
                return Ok(());
            }
            let current = current_value(ctx, subject, name);
            let decoded = decode_value(ctx, update, value, spec, &current, state)?;
            ctx.write(subject, name, decoded)?;
            Ok(())
        }
        PropertyUpdate::CollectionItem { index, value } => {
            if !spec.is_writable() {
                return Ok(());
            }
            let current = current_value(ctx, subject, name);
            let mut items = match current {
                PropertyValue::List(items) => items,
                PropertyValue::Null => Vec::new(),
                other => {
                    return Err(CoreError::TypeMismatch {
                        property: name.to_owned(),
                        expected: ValueKind::List.name(),
                        actual: other.kind().name(),
                    });
                }
            };
            let element_current = items.get(*index).cloned().unwrap_or_default();
            let decoded = decode_value(ctx, update, value, spec, &element_current, state)?;
            if *index < items.len() {
                items[*index] = decoded;
            } else if *index == items.len() {
                items.push(decoded);
            } else {
                tracing::warn!(
                    target: "weave.update",
                    property = name,
                    index,
                    len = items.len(),
                    "collection item index out of bounds, skipped"
                );
                return Ok(());
            }
            ctx.write(subject, name, PropertyValue::List(items))?;
            Ok(())
        }
        PropertyUpdate::MapItem { key, value } => {
            if !spec.is_writable() {
                return Ok(());
            }
            let current = current_value(ctx, subject, name);
            let mut entries = match current {
                PropertyValue::Map(entries) => entries,
                PropertyValue::Null => BTreeMap::new(),
                other => {
                    return Err(CoreError::TypeMismatch {
                        property: name.to_owned(),
                        expected: ValueKind::Map.name(),
                        actual: other.kind().name(),
                    });
                }
            };
            let element_current = entries.get(key).cloned().unwrap_or_default();
            let decoded = decode_value(ctx, update, value, spec, &element_current, state)?;
            entries.insert(key.clone(), decoded);
            ctx.write(subject, name, PropertyValue::Map(entries))?;
            Ok(())
        }
    }
}

fn current_value(ctx: &SubjectContext, subject: &SubjectHandle, name: &str) -> PropertyValue {
    ctx.read(subject, name).unwrap_or_default()
}

/// 解码一个更新值；`current` 是同一槽位的本地现值，用于稳定复用子主体。
fn decode_value(
    ctx: &SubjectContext,
    update: &SubjectUpdate,
    value: &UpdateValue,
    spec: &PropertySpec,
    current: &PropertyValue,
    state: &mut ApplyState<'_>,
) -> Result<PropertyValue, CoreError> {
    match value {
        UpdateValue::Null => Ok(PropertyValue::Null),
        UpdateValue::Bool { value } => Ok(PropertyValue::Bool(*value)),
        UpdateValue::Integer { value } => Ok(PropertyValue::Integer(*value)),
        UpdateValue::Float { value } => Ok(PropertyValue::Float(*value)),
        UpdateValue::Text { value } => Ok(PropertyValue::Text(value.clone())),
        UpdateValue::Ref { id } => {
            let handle = resolve_subject(ctx, update, id, spec, current, state)?;
            Ok(PropertyValue::Subject(handle))
        }
        UpdateValue::List { values } => {
            let current_items: &[PropertyValue] = match current {
                PropertyValue::List(items) => items,
                _ => &[],
            };
            let mut items = Vec::with_capacity(values.len());
            for (index, element) in values.iter().enumerate() {
                // 长度相等时逐位就地替换，子主体按位复用；长度不同则重建。
                let element_current = if current_items.len() == values.len() {
                    current_items.get(index).cloned().unwrap_or_default()
                } else {
                    PropertyValue::Null
                };
                items.push(decode_value(ctx, update, element, spec, &element_current, state)?);
            }
            Ok(PropertyValue::List(items))
        }
        UpdateValue::Map { entries } => {
            let mut out = BTreeMap::new();
            for (key, element) in entries {
                let element_current = match current {
                    PropertyValue::Map(map) => map.get(key).cloned().unwrap_or_default(),
                    _ => PropertyValue::Null,
                };
                out.insert(
                    key.clone(),
                    decode_value(ctx, update, element, spec, &element_current, state)?,
                );
            }
            Ok(PropertyValue::Map(out))
        }
    }
}

/// 解析被引用主体：已对账的 id 直接取用；否则复用本地现值中的实例
/// （稳定引用存续），再不然经注入工厂构造新主体。
fn resolve_subject(
    ctx: &SubjectContext,
    update: &SubjectUpdate,
    id: &str,
    spec: &PropertySpec,
    current: &PropertyValue,
    state: &mut ApplyState<'_>,
) -> Result<SubjectHandle, CoreError> {
    let handle = if let Some(handle) = state.resolved.get(id) {
        handle.clone()
    } else {
        let reused = match current {
            PropertyValue::Subject(existing) => Some(existing.clone()),
            _ => None,
        };
        let handle = match reused {
            Some(existing) => existing,
            None => match state.factory {
                Some(factory) => factory.create(ctx, spec, Some(id))?,
                None => {
                    return Err(CoreError::internal(format!(
                        "no local subject for incoming id `{id}` and no factory injected"
                    )));
                }
            },
        };
        state.resolved.insert(id.to_owned(), handle.clone());
        handle
    };
    apply_subject(ctx, update, id, &handle, state)?;
    Ok(handle)
}
