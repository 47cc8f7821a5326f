use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::CoreError;
use crate::subject::{PropertyRef, SubjectHandle};
use crate::value::PropertyValue;

/// 变更来源标签：入站桥在应用更新时以作用域守卫设置，
/// 队列处理器据此过滤回环变更。
#[derive(Clone, Debug)]
pub struct SourceTag(Arc<str>);

impl SourceTag {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(Arc::from(tag.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for SourceTag {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SourceTag {}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 一条已提交的属性变更记录。
///
/// 记录携带提交前后的存储值、提交时间戳与可选的来源标签。
/// 投影方法对存储类型做校验，类型不符时返回
/// [`CoreError::ProjectionMismatch`]。
#[derive(Clone, Debug)]
pub struct PropertyChange {
    property: PropertyRef,
    old_value: PropertyValue,
    new_value: PropertyValue,
    timestamp: SystemTime,
    source: Option<SourceTag>,
}

impl PropertyChange {
    pub fn new(
        property: PropertyRef,
        old_value: PropertyValue,
        new_value: PropertyValue,
        source: Option<SourceTag>,
    ) -> Self {
        Self {
            property,
            old_value,
            new_value,
            timestamp: SystemTime::now(),
            source,
        }
    }

    pub fn property(&self) -> &PropertyRef {
        &self.property
    }

    pub fn old_value(&self) -> &PropertyValue {
        &self.old_value
    }

    pub fn new_value(&self) -> &PropertyValue {
        &self.new_value
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn source(&self) -> Option<&SourceTag> {
        self.source.as_ref()
    }

    /// 新值的类型化投影。
    pub fn new_value_as<T: FromValue>(&self) -> Result<T, CoreError> {
        T::from_value(&self.new_value).ok_or_else(|| CoreError::ProjectionMismatch {
            property: self.property.name().to_owned(),
            expected: T::EXPECTED,
        })
    }

    /// 旧值的类型化投影。
    pub fn old_value_as<T: FromValue>(&self) -> Result<T, CoreError> {
        T::from_value(&self.old_value).ok_or_else(|| CoreError::ProjectionMismatch {
            property: self.property.name().to_owned(),
            expected: T::EXPECTED,
        })
    }
}

/// 从属性值到具体类型的受校验投影。
pub trait FromValue: Sized {
    const EXPECTED: &'static str;

    fn from_value(value: &PropertyValue) -> Option<Self>;
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "integer";

    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "text";

    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for SubjectHandle {
    const EXPECTED: &'static str = "subject";

    fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Subject(v) => Some(v.clone()),
            _ => None,
        }
    }
}
