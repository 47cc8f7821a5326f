use std::collections::BTreeMap;
use std::fmt;

use crate::subject::SubjectHandle;

/// 属性声明类型，约束属性槽可存放的值形态。
///
/// `Null` 对任意声明类型均为合法取值，表示“尚未赋值/已清空”。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    Text,
    Subject,
    List,
    Map,
}

impl ValueKind {
    /// 返回用于日志与错误信息的稳定名称。
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Subject => "subject",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 容器槽位：一条“属性 → 子主体”边在源容器中的位置。
///
/// - `Direct`：属性值本身就是主体；
/// - `Index(i)`：有序序列中的第 `i` 个元素；
/// - `Key(k)`：映射中键为 `k` 的值。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerSlot {
    Direct,
    Index(usize),
    Key(String),
}

impl ContainerSlot {
    /// 渲染为路径片段后缀：`[i]`、`[key]`，直接持有时为空。
    pub fn path_suffix(&self) -> String {
        match self {
            Self::Direct => String::new(),
            Self::Index(i) => format!("[{i}]"),
            Self::Key(k) => format!("[{k}]"),
        }
    }
}

/// 属性值的运行时表示。
///
/// # 设计背景（Why）
/// - 主体图是异构的：属性既可能承载标量，也可能承载子主体、有序序列或映射。
///   用枚举统一建模，拦截链、变更流与更新模型才能共享一套相等性与遍历语义。
/// - 参照配置值模型的做法，`List` 保序、`Map` 采用 `BTreeMap` 获得稳定迭代序。
///
/// # 契约说明（What）
/// - **相等性**：值类型按结构相等；`Subject` 按句柄指针同一性比较。
///   这是整个写入管线的规范相等闸门：写入未改变存储值时不推进变更流。
/// - **后置条件**：所有变体可克隆；`Subject` 克隆仅复制句柄。
///
/// # 设计取舍（Trade-offs）
/// - 浮点相等采用 IEEE `==`，`NaN != NaN` 意味着写入 `NaN` 总会视为变更；
///   这一行为与声明类型无关，由调用方自行规避。
#[derive(Clone, Debug, Default)]
pub enum PropertyValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Subject(SubjectHandle),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Subject(a), Self::Subject(b)) => a.same_identity(b),
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PropertyValue {
    /// 返回值的实际类型。
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Integer(_) => ValueKind::Integer,
            Self::Float(_) => ValueKind::Float,
            Self::Text(_) => ValueKind::Text,
            Self::Subject(_) => ValueKind::Subject,
            Self::List(_) => ValueKind::List,
            Self::Map(_) => ValueKind::Map,
        }
    }

    /// 判断值是否符合属性声明类型；`Null` 对任意声明均合法。
    pub fn conforms_to(&self, declared: ValueKind) -> bool {
        matches!(self, Self::Null) || self.kind() == declared || declared == ValueKind::Null
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// 按值形态提取直接包含的子主体及其槽位。
    ///
    /// 提取规则：主体直接返回；有序序列返回所有主体元素及其下标；
    /// 映射返回所有主体值及其键；标量不产生任何边。
    /// 不做深层遍历——已挂接子主体的更深层边由其自身的写入产生。
    pub fn contained_subjects(&self) -> Vec<(ContainerSlot, SubjectHandle)> {
        match self {
            Self::Subject(handle) => vec![(ContainerSlot::Direct, handle.clone())],
            Self::List(items) => items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    Self::Subject(handle) => Some((ContainerSlot::Index(i), handle.clone())),
                    _ => None,
                })
                .collect(),
            Self::Map(entries) => entries
                .iter()
                .filter_map(|(key, item)| match item {
                    Self::Subject(handle) => {
                        Some((ContainerSlot::Key(key.clone()), handle.clone()))
                    }
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// 新旧两值的边差集：`(新增边, 失去边)`，按 `(槽位, 主体)` 精确比较。
/// 两侧共享的边不出现在任何一侧。
pub(crate) fn edge_diff(
    old: &PropertyValue,
    new: &PropertyValue,
) -> (
    Vec<(ContainerSlot, SubjectHandle)>,
    Vec<(ContainerSlot, SubjectHandle)>,
) {
    let old_edges = old.contained_subjects();
    let new_edges = new.contained_subjects();
    let gained = new_edges
        .iter()
        .filter(|(slot, subject)| {
            !old_edges.iter().any(|(s, h)| s == slot && h == subject)
        })
        .cloned()
        .collect();
    let lost = old_edges
        .iter()
        .filter(|(slot, subject)| {
            !new_edges.iter().any(|(s, h)| s == slot && h == subject)
        })
        .cloned()
        .collect();
    (gained, lost)
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<SubjectHandle> for PropertyValue {
    fn from(value: SubjectHandle) -> Self {
        Self::Subject(value)
    }
}
