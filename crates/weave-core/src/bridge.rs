//! 核心对外的桥接缝：主体工厂与路径提供者。
//!
//! 桥（OPC UA、WebSocket 等）只通过这些对象安全 trait、变更流订阅、
//! 快照构建/应用与队列处理器同核心交互。

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::subject::{PropertyRef, PropertySpec, SubjectHandle};

/// 主体工厂：给定属性元数据与可选提示，构造声明类型的主体。
pub trait SubjectFactory: Send + Sync {
    fn create(
        &self,
        ctx: &SubjectContext,
        spec: &PropertySpec,
        hint: Option<&str>,
    ) -> Result<SubjectHandle, CoreError>;
}

impl<F> SubjectFactory for F
where
    F: Fn(&SubjectContext, &PropertySpec, Option<&str>) -> Result<SubjectHandle, CoreError>
        + Send
        + Sync,
{
    fn create(
        &self,
        ctx: &SubjectContext,
        spec: &PropertySpec,
        hint: Option<&str>,
    ) -> Result<SubjectHandle, CoreError> {
        self(ctx, spec, hint)
    }
}

/// 路径提供者：返回属性在某一桥下的路径片段；`None` 表示该属性
/// 被该桥排除。
pub trait PathProvider: Send + Sync {
    fn path_of(&self, prop: &PropertyRef) -> Option<String>;
}

/// 以登记簿规范点分路径作为桥路径的默认提供者。
pub struct RegistryPathProvider {
    ctx: SubjectContext,
}

impl RegistryPathProvider {
    pub fn new(ctx: SubjectContext) -> Self {
        Self { ctx }
    }
}

impl PathProvider for RegistryPathProvider {
    fn path_of(&self, prop: &PropertyRef) -> Option<String> {
        self.ctx.registry().path_of(prop)
    }
}
