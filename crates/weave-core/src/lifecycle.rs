//! 生命周期引擎：挂接/解挂转变的收集、结算与事件派发。
//!
//! # 教案级导览
//!
//! - **Why**：引用计数是成员资格的唯一事实来源。连边/断边原语在越过
//!   0/1 边界时只负责“上报转变”，事件派发与级联延后到帧提交，保证
//!   同一次写入内“先增后减”的共享主体不会产生虚假事件。
//! - **How**：转变帧是线程本地栈。写链的生命周期层在进入时开帧、成功时
//!   提交、失败时废弃。结算时挂接按“父先子后”的拓扑序发事件，解挂按
//!   其逆序（级联先清子、最后发自身）。
//! - **What**：`attach` 仅在计数 0→1 时触发一次；`detach` 仅在 1→0 时
//!   触发一次。环由计数自然拆解：闭环的最后一条边只会把已登记目标的
//!   计数推到 ≥ 2。

use std::cell::RefCell;

use crate::context::SubjectContext;
use crate::subject::{PropertyRef, SubjectHandle};

/// 挂接/解挂回调。实现方注册到上下文后，对每个越过边界的主体恰好
/// 收到一次对应事件。
pub trait LifecycleHandler: Send + Sync {
    fn on_attach(&self, ctx: &SubjectContext, subject: &SubjectHandle) {
        let _ = (ctx, subject);
    }

    fn on_detach(&self, ctx: &SubjectContext, subject: &SubjectHandle) {
        let _ = (ctx, subject);
    }
}

enum Transition {
    Attached {
        subject: SubjectHandle,
        via: Option<SubjectHandle>,
    },
    Detached {
        subject: SubjectHandle,
        via: Option<SubjectHandle>,
    },
}

thread_local! {
    static FRAMES: RefCell<Vec<Vec<Transition>>> = const { RefCell::new(Vec::new()) };
}

/// 开启一个转变帧；随后的连边/断边把越界转变记入该帧。
pub(crate) fn begin_frame() {
    FRAMES.with(|frames| frames.borrow_mut().push(Vec::new()));
}

/// 提交当前帧：按序结算所有转变（结算过程中联动的转变以嵌套帧收集）。
pub(crate) fn commit_frame(ctx: &SubjectContext) {
    let frame = FRAMES.with(|frames| frames.borrow_mut().pop());
    for transition in frame.unwrap_or_default() {
        process(ctx, transition);
    }
}

/// 废弃当前帧；调用前计数必须已由失败路径恢复。
pub(crate) fn abort_frame() {
    FRAMES.with(|frames| {
        frames.borrow_mut().pop();
    });
}

pub(crate) fn note_attached(subject: &SubjectHandle, via: Option<&SubjectHandle>) {
    note(Transition::Attached {
        subject: subject.clone(),
        via: via.cloned(),
    });
}

pub(crate) fn note_detached(subject: &SubjectHandle, via: Option<&SubjectHandle>) {
    note(Transition::Detached {
        subject: subject.clone(),
        via: via.cloned(),
    });
}

fn note(transition: Transition) {
    FRAMES.with(|frames| {
        if let Some(frame) = frames.borrow_mut().last_mut() {
            frame.push(transition);
        }
    });
}

fn collect_nested(work: impl FnOnce()) -> Vec<Transition> {
    begin_frame();
    work();
    FRAMES
        .with(|frames| frames.borrow_mut().pop())
        .unwrap_or_default()
}

fn process(ctx: &SubjectContext, transition: Transition) {
    match transition {
        Transition::Attached { subject, via } => attach_ceremony(ctx, &subject, via.as_ref()),
        Transition::Detached { subject, via } => detach_ceremony(ctx, &subject, via.as_ref()),
    }
}

/// 挂接仪式：继承父方拦截器集合、逐属性执行初始化器、派发事件，
/// 最后把本主体存储值中包含的子主体重新连边（幂等，已计数的边被跳过），
/// 联动挂接的子主体随之进入各自的仪式——父先子后。
fn attach_ceremony(ctx: &SubjectContext, subject: &SubjectHandle, via: Option<&SubjectHandle>) {
    tracing::debug!(
        target: "weave.lifecycle",
        subject = %subject.type_name(),
        "subject attached"
    );
    if let Some(parent) = via {
        subject.interceptors().inherit_from(parent.interceptors());
    }
    for spec in subject.properties() {
        for initializer in spec.initializers() {
            initializer(ctx, subject, &spec);
        }
    }
    for handler in ctx.lifecycle_handlers() {
        handler.on_attach(ctx, subject);
    }
    let nested = collect_nested(|| {
        for spec in subject.properties() {
            let Some(slot) = subject.slot_of(spec.name()) else {
                continue;
            };
            let value = subject.storage_get(slot);
            let prop = PropertyRef::new(subject.clone(), spec.name());
            for (container_slot, child) in value.contained_subjects() {
                ctx.registry().link(&prop, container_slot, &child);
            }
        }
    });
    for transition in nested {
        process(ctx, transition);
    }
}

/// 解挂仪式：先断开本主体的全部出边并结算由此跌落的子主体（子先于父
/// 收到事件），随后清理派生索引、移除继承的拦截器层，最后派发自身事件。
fn detach_ceremony(ctx: &SubjectContext, subject: &SubjectHandle, via: Option<&SubjectHandle>) {
    let nested = collect_nested(|| {
        for (name, slot, child) in ctx.registry().out_edges(subject) {
            let prop = PropertyRef::new(subject.clone(), &name);
            ctx.registry().unlink(&prop, &slot, &child);
        }
    });
    for transition in nested {
        process(ctx, transition);
    }
    ctx.derived_index().remove_subject(subject.id());
    if let Some(parent) = via {
        subject.interceptors().disinherit(parent.interceptors());
    }
    for handler in ctx.lifecycle_handlers() {
        handler.on_detach(ctx, subject);
    }
    tracing::debug!(
        target: "weave.lifecycle",
        subject = %subject.type_name(),
        "subject detached"
    );
}
