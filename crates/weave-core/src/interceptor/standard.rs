//! 标准拦截器：等值闸门、校验、变更发布、生命周期、父子簿记、依赖记录。
//!
//! 写链装配顺序（最外层在前）：
//! `等值闸门 → 校验 → [主体自定义层] → 变更发布 → 生命周期 → 父子簿记 → 落盘`。
//! 回卷时父子簿记先完成边维护，生命周期随后结算挂接/解挂事件，
//! 变更发布最后发射记录，保证订阅者观察到的登记簿已一致。

use std::sync::Arc;

use crate::context::SubjectContext;
use crate::error::CoreError;
use crate::interceptor::{
    ReadInterceptor, ReadNext, WriteInterceptor, WriteNext, WriteOutcome,
};
use crate::lifecycle;
use crate::subject::PropertyRef;
use crate::tracking::derived;
use crate::value::PropertyValue;

/// 标准链的组成部分；主体自定义层在 `write_outer` 与 `write_inner` 之间拼接。
pub(crate) struct StandardChains {
    pub reads: Vec<Arc<dyn ReadInterceptor>>,
    pub write_outer: Vec<Arc<dyn WriteInterceptor>>,
    pub write_inner: Vec<Arc<dyn WriteInterceptor>>,
}

pub(crate) fn standard_chains() -> StandardChains {
    StandardChains {
        reads: vec![Arc::new(DependencyRecorder)],
        write_outer: vec![Arc::new(EqualityGate), Arc::new(Validation)],
        write_inner: vec![
            Arc::new(ChangePublication),
            Arc::new(Lifecycle),
            Arc::new(ParentTracking),
        ],
    }
}

/// 等值闸门：提议值与存储值相等（值类型按结构、主体按指针同一性）时
/// 短路返回，不推进变更流，也不触发任何下游副作用。
struct EqualityGate;

impl WriteInterceptor for EqualityGate {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError> {
        if proposed == *current {
            return Ok(WriteOutcome::Unchanged);
        }
        next.proceed(ctx, prop, current, proposed)
    }
}

/// 校验：依次执行属性声明的校验器，任一失败即拒绝写入。
struct Validation;

impl WriteInterceptor for Validation {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError> {
        if let Some(spec) = prop.spec() {
            for validator in spec.validators() {
                validator(prop, &proposed)?;
            }
        }
        next.proceed(ctx, prop, current, proposed)
    }
}

/// 变更发布：内层全部成功后发射 `PropertyChange` 记录，并为受影响的
/// 派生属性排队重算。
struct ChangePublication;

impl WriteInterceptor for ChangePublication {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError> {
        let outcome = next.proceed(ctx, prop, current, proposed)?;
        if let WriteOutcome::Committed { old, new } = &outcome {
            ctx.publish_change(prop, old.clone(), new.clone());
        }
        Ok(outcome)
    }
}

/// 生命周期：围绕内层建立转变帧；边增删越过 0/1 边界产生的挂接与解挂
/// 转变在提交时统一结算（先全部边变更、再按拓扑次序发事件）。
struct Lifecycle;

impl WriteInterceptor for Lifecycle {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError> {
        lifecycle::begin_frame();
        match next.proceed(ctx, prop, current, proposed) {
            Ok(outcome) => {
                lifecycle::commit_frame(ctx);
                Ok(outcome)
            }
            Err(err) => {
                lifecycle::abort_frame();
                Err(err)
            }
        }
    }
}

/// 父子簿记：按 (槽位, 主体) 对旧值与新值做边差集，提交后先连新边、
/// 再断旧边。增量先于减量执行，新旧两侧共享的主体计数先升后降，
/// 不会越过 0/1 边界，因此不产生事件。
struct ParentTracking;

impl WriteInterceptor for ParentTracking {
    fn write(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        current: &PropertyValue,
        proposed: PropertyValue,
        next: WriteNext<'_>,
    ) -> Result<WriteOutcome, CoreError> {
        let outcome = next.proceed(ctx, prop, current, proposed)?;
        if let WriteOutcome::Committed { old, new } = &outcome {
            let (gained, lost) = crate::value::edge_diff(old, new);
            for (slot, subject) in gained {
                ctx.registry().link(prop, slot, &subject);
            }
            for (slot, subject) in lost {
                ctx.registry().unlink(prop, &slot, &subject);
            }
        }
        Ok(outcome)
    }
}

/// 依赖记录器：派生属性重算期间（最外层）把每个被读属性引用
/// 追加进当前线程的记录帧。
struct DependencyRecorder;

impl ReadInterceptor for DependencyRecorder {
    fn read(
        &self,
        ctx: &SubjectContext,
        prop: &PropertyRef,
        next: ReadNext<'_>,
    ) -> Result<PropertyValue, CoreError> {
        derived::record_read(prop);
        next.proceed(ctx, prop)
    }
}
