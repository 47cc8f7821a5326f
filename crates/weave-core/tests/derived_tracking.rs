//! 派生属性与动态表面测试套件。
//!
//! 覆盖：依赖按实际读取重录（条件短路）、带 setter 的派生属性、
//! 派生环检测、动态属性/特性参与变更流与路径寻址。

use std::sync::Arc;

use weave_core::prelude::*;

/// `computed = localFlag OR source`，带写穿 setter（写 localFlag）。
fn flag_shape() -> Arc<SubjectShape> {
    SubjectShape::builder("Flags")
        .property(PropertySpec::stored("localFlag", ValueKind::Bool))
        .property(PropertySpec::stored("source", ValueKind::Bool))
        .property(
            PropertySpec::derived(
                "computed",
                ValueKind::Bool,
                Arc::new(|ctx: &SubjectContext, subject: &SubjectHandle| {
                    if let PropertyValue::Bool(true) = ctx.read(subject, "localFlag")? {
                        return Ok(PropertyValue::Bool(true));
                    }
                    ctx.read(subject, "source")
                }),
            )
            .with_custom_writer(Arc::new(
                |ctx: &SubjectContext, subject: &SubjectHandle, value: &PropertyValue| {
                    ctx.write(subject, "localFlag", value.clone()).map(|_| ())
                },
            )),
        )
        .build()
}

fn drain_for<'a>(
    subscription: &mut ChangeSubscription,
    name: &str,
    sink: &'a mut Vec<PropertyValue>,
) -> &'a [PropertyValue] {
    while let Some(change) = subscription.try_recv() {
        if change.property().name() == name {
            sink.push(change.new_value().clone());
        }
    }
    sink.as_slice()
}

/// 条件短路后的依赖重录：未读到的属性不触发重算；setter 驱动状态
/// 变化后，下一次求值按实际读取重录依赖。
#[test]
fn dependencies_rerecord_after_setter_state_change() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, flag_shape());
    subject.set("localFlag", true).unwrap();
    subject.set("source", true).unwrap();

    assert_eq!(
        subject.get("computed").unwrap(),
        PropertyValue::Bool(true),
        "短路分支下求值为 true"
    );

    let mut subscription = ctx.subscribe(64);
    // source 不在当前依赖集中：写它不得触发 computed 重算。
    subject.set("source", false).unwrap();
    let mut observed = Vec::new();
    assert!(
        drain_for(&mut subscription, "computed", &mut observed).is_empty(),
        "短路未读到的依赖不触发重算"
    );
    assert_eq!(subject.get("computed").unwrap(), PropertyValue::Bool(true));

    // 经 setter 写派生属性：写穿 localFlag，随后重算并重录依赖。
    subject.set("computed", false).unwrap();
    assert_eq!(subject.get("localFlag").unwrap(), PropertyValue::Bool(false));
    assert_eq!(
        subject.get("computed").unwrap(),
        PropertyValue::Bool(false),
        "重算读到 source=false"
    );

    observed.clear();
    drain_for(&mut subscription, "computed", &mut observed);
    // 此时依赖集含 source：写 source 触发重算并发射变更。
    subject.set("source", true).unwrap();
    observed.clear();
    let fired = drain_for(&mut subscription, "computed", &mut observed);
    assert_eq!(
        fired.last(),
        Some(&PropertyValue::Bool(true)),
        "依赖重录后 source 的变化必须触发 computed"
    );

    subject.set("source", false).unwrap();
    observed.clear();
    let fired = drain_for(&mut subscription, "computed", &mut observed);
    assert_eq!(fired.last(), Some(&PropertyValue::Bool(false)));
}

/// 派生属性仅在缓存值真正改变时发射自身变更。
#[test]
fn derived_emits_only_on_value_change() {
    let ctx = SubjectContext::new();
    let shape = SubjectShape::builder("Sum")
        .property(PropertySpec::stored("a", ValueKind::Integer))
        .property(PropertySpec::stored("b", ValueKind::Integer))
        .property(PropertySpec::derived(
            "clampedPositive",
            ValueKind::Bool,
            Arc::new(|ctx: &SubjectContext, subject: &SubjectHandle| {
                let a = match ctx.read(subject, "a")? {
                    PropertyValue::Integer(v) => v,
                    _ => 0,
                };
                let b = match ctx.read(subject, "b")? {
                    PropertyValue::Integer(v) => v,
                    _ => 0,
                };
                Ok(PropertyValue::Bool(a + b > 0))
            }),
        ))
        .build();
    let subject = SubjectHandle::new(&ctx, shape);
    subject.set("a", 1i64).unwrap();
    subject.set("b", 1i64).unwrap();
    assert_eq!(subject.get("clampedPositive").unwrap(), PropertyValue::Bool(true));

    let mut subscription = ctx.subscribe(64);
    // 和从 2 变到 3：布尔结果不变，不得发射派生变更。
    subject.set("a", 2i64).unwrap();
    let mut observed = Vec::new();
    assert!(
        drain_for(&mut subscription, "clampedPositive", &mut observed).is_empty(),
        "结果未变时派生属性保持沉默"
    );

    subject.set("a", -10i64).unwrap();
    observed.clear();
    let fired = drain_for(&mut subscription, "clampedPositive", &mut observed);
    assert_eq!(fired.last(), Some(&PropertyValue::Bool(false)));
}

/// 互相读取的派生属性构成环，读取以派生环错误同步失败。
#[test]
fn mutual_derivation_is_a_cycle() {
    let ctx = SubjectContext::new();
    let shape = SubjectShape::builder("Loop")
        .property(PropertySpec::derived(
            "left",
            ValueKind::Integer,
            Arc::new(|ctx: &SubjectContext, subject: &SubjectHandle| {
                ctx.read(subject, "right")
            }),
        ))
        .property(PropertySpec::derived(
            "right",
            ValueKind::Integer,
            Arc::new(|ctx: &SubjectContext, subject: &SubjectHandle| {
                ctx.read(subject, "left")
            }),
        ))
        .build();
    let subject = SubjectHandle::new(&ctx, shape);
    let err = subject.get("left").expect_err("派生环必须被检出");
    assert!(matches!(err, CoreError::DerivationCycle { .. }));
}

/// 动态属性与特性是一等公民：参与变更流并以 `@` 寻址。
#[test]
fn dynamic_properties_and_attributes_are_first_class() {
    let ctx = SubjectContext::new();
    let shape = SubjectShape::builder("Sensor")
        .property(PropertySpec::stored("temperature", ValueKind::Float))
        .build();
    let sensor = SubjectHandle::new(&ctx, shape);
    ctx.attach_root(&sensor);

    ctx.add_dynamic_property(&sensor, PropertySpec::stored("label", ValueKind::Text))
        .expect("动态属性挂载成功");
    ctx.add_dynamic_property(
        &sensor,
        PropertySpec::attribute("temperature", "unit", ValueKind::Text),
    )
    .expect("属性特性挂载成功");

    let mut subscription = ctx.subscribe(16);
    sensor.set("label", "north-wall").unwrap();
    sensor.set("temperature@unit", "celsius").unwrap();

    let first = subscription.try_recv().expect("动态属性写入推进变更流");
    assert_eq!(first.property().name(), "label");
    let second = subscription.try_recv().expect("特性写入推进变更流");
    assert_eq!(second.property().name(), "temperature@unit");

    let attr = PropertyRef::new(sensor.clone(), "temperature@unit");
    assert_eq!(
        ctx.registry().path_of(&attr).as_deref(),
        Some("temperature@unit"),
        "特性路径是基属性路径加 @ 后缀"
    );

    // 派生动态特性：依赖基属性，自动重算。
    ctx.add_dynamic_property(
        &sensor,
        PropertySpec::derived_attribute(
            "temperature",
            "fahrenheit",
            ValueKind::Float,
            Arc::new(|ctx: &SubjectContext, subject: &SubjectHandle| {
                match ctx.read(subject, "temperature")? {
                    PropertyValue::Float(c) => Ok(PropertyValue::Float(c * 9.0 / 5.0 + 32.0)),
                    _ => Ok(PropertyValue::Null),
                }
            }),
        ),
    )
    .unwrap();
    sensor.set("temperature", 100.0f64).unwrap();
    assert_eq!(
        sensor.get("temperature@fahrenheit").unwrap(),
        PropertyValue::Float(212.0)
    );
}

/// 嵌套主体的规范点分路径。
#[test]
fn canonical_paths_walk_first_parents() {
    let ctx = SubjectContext::new();
    let shape = SubjectShape::builder("Node")
        .property(PropertySpec::stored("title", ValueKind::Text))
        .property(PropertySpec::stored("items", ValueKind::List))
        .build();
    let root = SubjectHandle::new(&ctx, shape.clone());
    ctx.attach_root(&root);
    let leaf = SubjectHandle::new(&ctx, shape);
    root.set(
        "items",
        PropertyValue::List(vec![PropertyValue::Null, PropertyValue::Subject(leaf.clone())]),
    )
    .unwrap();

    let title = PropertyRef::new(leaf.clone(), "title");
    assert_eq!(
        ctx.registry().path_of(&title).as_deref(),
        Some("items[1].title"),
        "序列边以 [i] 入路径"
    );

    let all = ctx.registry().all_properties(&root);
    assert!(
        all.iter().any(|(path, _)| path == "items[1].title"),
        "环安全遍历必须覆盖嵌套属性"
    );

    // 默认路径提供者直接复用登记簿的规范路径。
    let provider = weave_core::bridge::RegistryPathProvider::new(ctx.clone());
    use weave_core::bridge::PathProvider as _;
    assert_eq!(provider.path_of(&title).as_deref(), Some("items[1].title"));
}
