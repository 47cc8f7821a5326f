#![deny(unsafe_code)]
#![doc = "weave-core: 反应式可观察主体图的核心引擎。"]
#![doc = ""]
#![doc = "四个紧耦合子系统：围绕每次属性读写的拦截管线；容环且引用计数驱动的"]
#![doc = "主体登记簿；变更追踪与派生属性重算；以及线格式无关的主体更新模型。"]
#![doc = "协议桥（如 WebSocket 主体协议）构建在这些缝之上，见 `weave-bridge-ws`。"]

pub mod bridge;
pub mod contract;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod subject;
pub mod tracking;
pub mod update;
pub mod value;

pub use context::SubjectContext;
pub use contract::Cancellation;
pub use error::CoreError;
pub use subject::{PropertyRef, PropertySpec, SubjectHandle, SubjectShape};
pub use tracking::{PropertyChange, SourceTag};
pub use value::{PropertyValue, ValueKind};

/// 常用导出的集中入口。
pub mod prelude {
    pub use crate::bridge::{PathProvider, SubjectFactory};
    pub use crate::context::SubjectContext;
    pub use crate::contract::Cancellation;
    pub use crate::error::CoreError;
    pub use crate::interceptor::{
        InterceptorSet, ReadInterceptor, ReadNext, WriteInterceptor, WriteNext, WriteOutcome,
    };
    pub use crate::lifecycle::LifecycleHandler;
    pub use crate::queue::{BatchHandler, ChangeQueueConfig, ChangeQueueProcessor};
    pub use crate::subject::{
        PropertyKey, PropertyRef, PropertySpec, Reader, ShapeBuilder, SubjectHandle, SubjectShape,
        Writer,
    };
    pub use crate::tracking::{
        ChangeSubscription, PropertyChange, SourceScope, SourceTag, current_source,
    };
    pub use crate::update::{
        ApplyOptions, PropertyUpdate, SubjectProperties, SubjectUpdate, UpdateValue, apply,
        create_complete, create_partial_from_changes,
    };
    pub use crate::value::{ContainerSlot, PropertyValue, ValueKind};
}
