use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 一个主体的属性更新集：属性名 → 更新。
pub type SubjectProperties = BTreeMap<String, PropertyUpdate>;

/// 线格式无关的主体图快照（部分或完整）。
///
/// # 契约说明（What）
/// - `root`：更新根主体的字符串 id。
/// - `subjects`：主体 id → 属性名 → [`PropertyUpdate`]。
/// - 主体 id 仅在单条更新内稳定，不存在跨消息身份；接收方按图形状
///   对账自身图，而不是按 id。
/// - 主体值属性的载荷是被引用主体的 id，该 id 必须出现在 `subjects` 键中。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubjectUpdate {
    pub root: String,
    pub subjects: BTreeMap<String, SubjectProperties>,
}

impl SubjectUpdate {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            subjects: BTreeMap::new(),
        }
    }
}

/// 单属性更新，按 `kind` 标签区分。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyUpdate {
    /// 整值替换；集合为有序序列、映射为键值集，元素遵循同一标量/主体 id 规则。
    Value { value: UpdateValue },
    /// 有序集合的增量单元素更新。
    CollectionItem { index: usize, value: UpdateValue },
    /// 映射的增量单键更新。
    MapItem { key: String, value: UpdateValue },
    /// 属性被移除。
    Absence,
}

/// 更新载荷中的值：标量、主体 id 引用、序列或映射。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateValue {
    Null,
    Bool { value: bool },
    Integer { value: i64 },
    Float { value: f64 },
    Text { value: String },
    /// 被引用主体的 id；id 必须出现在外层 `subjects` 中。
    Ref { id: String },
    List { values: Vec<UpdateValue> },
    Map { entries: Vec<(String, UpdateValue)> },
}
