//! 变更追踪：变更记录、来源标签、多订阅者变更流与派生属性重算。

pub mod change;
pub mod derived;
pub mod source;
pub mod stream;

pub use change::{FromValue, PropertyChange, SourceTag};
pub use source::{SourceScope, current_source};
pub use stream::{ChangeHub, ChangeSubscription};
