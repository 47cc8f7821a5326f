//! 拦截管线测试套件：等值闸门、校验、链序与短路。

use std::sync::{Arc, Mutex};

use weave_core::prelude::*;

fn counter_shape() -> Arc<SubjectShape> {
    SubjectShape::builder("Counter")
        .property(PropertySpec::stored("value", ValueKind::Integer))
        .property(
            PropertySpec::stored("bounded", ValueKind::Integer).with_validator(Arc::new(
                |prop: &PropertyRef, value: &PropertyValue| match value {
                    PropertyValue::Integer(v) if *v < 0 => Err(CoreError::Validation {
                        property: prop.name().to_owned(),
                        reason: format!("negative value {v} rejected"),
                    }),
                    _ => Ok(()),
                },
            )),
        )
        .build()
}

/// 等值闸门：发射的变更数等于真正改变存储值的写入数。
#[test]
fn equality_gate_counts_effective_writes() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    let mut subscription = ctx.subscribe(64);

    let writes: [i64; 6] = [1, 1, 2, 2, 2, 3];
    for value in writes {
        subject.set("value", value).unwrap();
    }
    assert_eq!(
        subject.get("value").unwrap(),
        PropertyValue::Integer(3),
        "写后读必须返回最后写入值"
    );

    let mut observed = Vec::new();
    while let Some(change) = subscription.try_recv() {
        observed.push(change.new_value_as::<i64>().unwrap());
    }
    assert_eq!(observed, [1, 2, 3], "重复写入不得推进变更流");
}

/// 校验失败同步浮出且不产生变更。
#[test]
fn validation_rejects_synchronously() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    let mut subscription = ctx.subscribe(16);

    subject.set("bounded", 5i64).unwrap();
    let err = subject.set("bounded", -1i64).expect_err("负值必须被拒绝");
    assert!(matches!(err, CoreError::Validation { .. }));
    assert_eq!(
        subject.get("bounded").unwrap(),
        PropertyValue::Integer(5),
        "被拒绝的写入不得落盘"
    );

    let mut count = 0;
    while subscription.try_recv().is_some() {
        count += 1;
    }
    assert_eq!(count, 1, "只有成功写入产生变更记录");
}

/// 声明类型不符的直接写入同步报错。
#[test]
fn write_rejects_kind_mismatch() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    let err = subject
        .set("value", "text")
        .expect_err("文本写入整数属性必须失败");
    assert!(matches!(err, CoreError::TypeMismatch { .. }));
}

/// 自定义写拦截器按注册顺序洋葱式组合：先注册者先进入、后收尾。
#[test]
fn custom_write_interceptors_compose_like_middleware() {
    struct Tagger {
        tag: &'static str,
        trace: Arc<Mutex<Vec<String>>>,
    }

    impl WriteInterceptor for Tagger {
        fn write(
            &self,
            ctx: &SubjectContext,
            prop: &PropertyRef,
            current: &PropertyValue,
            proposed: PropertyValue,
            next: WriteNext<'_>,
        ) -> Result<WriteOutcome, CoreError> {
            self.trace.lock().unwrap().push(format!("enter:{}", self.tag));
            let outcome = next.proceed(ctx, prop, current, proposed)?;
            self.trace.lock().unwrap().push(format!("exit:{}", self.tag));
            Ok(outcome)
        }
    }

    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    let trace = Arc::new(Mutex::new(Vec::new()));
    subject.interceptors().add_set(
        InterceptorSet::builder()
            .write(Arc::new(Tagger {
                tag: "outer",
                trace: trace.clone(),
            }))
            .write(Arc::new(Tagger {
                tag: "inner",
                trace: trace.clone(),
            }))
            .build(),
    );

    subject.set("value", 7i64).unwrap();
    assert_eq!(
        trace.lock().unwrap().as_slice(),
        ["enter:outer", "enter:inner", "exit:inner", "exit:outer"],
        "最外层先进入，回卷时逆序收尾"
    );
}

/// 自定义读拦截器可以短路，不再触达存储。
#[test]
fn read_interceptor_may_short_circuit() {
    struct Pinned;

    impl ReadInterceptor for Pinned {
        fn read(
            &self,
            _ctx: &SubjectContext,
            _prop: &PropertyRef,
            _next: ReadNext<'_>,
        ) -> Result<PropertyValue, CoreError> {
            Ok(PropertyValue::Integer(42))
        }
    }

    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    subject.set("value", 1i64).unwrap();
    subject
        .interceptors()
        .add_set(InterceptorSet::builder().read(Arc::new(Pinned)).build());
    assert_eq!(
        subject.get("value").unwrap(),
        PropertyValue::Integer(42),
        "短路读拦截器必须接管返回值"
    );
}

/// 写拦截器可以改写生效值后再交给下一层。
#[test]
fn write_interceptor_rewrites_effective_value() {
    struct Clamp;

    impl WriteInterceptor for Clamp {
        fn write(
            &self,
            ctx: &SubjectContext,
            prop: &PropertyRef,
            current: &PropertyValue,
            proposed: PropertyValue,
            next: WriteNext<'_>,
        ) -> Result<WriteOutcome, CoreError> {
            let effective = match proposed {
                PropertyValue::Integer(v) if v > 100 => PropertyValue::Integer(100),
                other => other,
            };
            next.proceed(ctx, prop, current, effective)
        }
    }

    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    subject
        .interceptors()
        .add_set(InterceptorSet::builder().write(Arc::new(Clamp)).build());
    subject.set("value", 500i64).unwrap();
    assert_eq!(
        subject.get("value").unwrap(),
        PropertyValue::Integer(100),
        "生效值由拦截器截断后落盘"
    );
}

/// 并发数据袋独立于属性槽，不经过拦截链。
#[test]
fn data_bag_bypasses_the_pipeline() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, counter_shape());
    let mut subscription = ctx.subscribe(16);

    subject
        .data_bag()
        .insert("nodeId".to_owned(), PropertyValue::from("ns=2;s=counter"));
    assert_eq!(
        subject.data_bag().get("nodeId").map(|v| v.clone()),
        Some(PropertyValue::from("ns=2;s=counter"))
    );
    assert!(
        subscription.try_recv().is_none(),
        "数据袋写入不产生属性变更"
    );
}

/// 只读与只写属性的方向检查。
#[test]
fn access_direction_is_enforced() {
    let ctx = SubjectContext::new();
    let shape = SubjectShape::builder("Gauge")
        .property(PropertySpec::stored("frozen", ValueKind::Integer).read_only())
        .property(PropertySpec::stored("sink", ValueKind::Integer).write_only())
        .build();
    let subject = SubjectHandle::new(&ctx, shape);

    assert!(matches!(
        subject.set("frozen", 1i64),
        Err(CoreError::AccessDenied { .. })
    ));
    assert!(matches!(
        subject.get("sink"),
        Err(CoreError::AccessDenied { .. })
    ));
    subject.set("sink", 9i64).expect("只写属性可写");
}
