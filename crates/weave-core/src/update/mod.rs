//! 主体更新模型：线格式无关的部分/完整图快照及其构建与应用。

mod apply;
mod build;
mod model;

pub use apply::{ApplyOptions, apply};
pub use build::{create_complete, create_partial_from_changes};
pub use model::{PropertyUpdate, SubjectProperties, SubjectUpdate, UpdateValue};
