//! 变更队列处理器测试套件：聚并、回环过滤、重试与取消。
//!
//! 异步测试使用真实时钟，窗口留有宽裕余量以避免时序抖动。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use weave_core::prelude::*;

fn gauge_shape() -> Arc<SubjectShape> {
    SubjectShape::builder("Gauge")
        .property(PropertySpec::stored("level", ValueKind::Integer))
        .property(PropertySpec::stored("label", ValueKind::Text))
        .build()
}

type Batches = Arc<Mutex<Vec<Vec<(String, PropertyValue)>>>>;

fn recording_handler(batches: Batches) -> impl BatchHandler {
    move |batch: Vec<PropertyChange>| {
        let batches = batches.clone();
        async move {
            batches.lock().unwrap().push(
                batch
                    .iter()
                    .map(|c| (c.property().name().to_owned(), c.new_value().clone()))
                    .collect(),
            );
            Ok(())
        }
    }
}

/// 窗口内同一属性聚并为最后观测值，批次保持首次出现的次序。
#[tokio::test(flavor = "multi_thread")]
async fn window_coalesces_to_latest_value() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, gauge_shape());
    let subscription = ctx.subscribe(256);

    subject.set("level", 1i64).unwrap();
    subject.set("label", "a").unwrap();
    subject.set("level", 2i64).unwrap();
    subject.set("level", 3i64).unwrap();

    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cancel = Cancellation::new();
    let worker = tokio::spawn(ChangeQueueProcessor::run(
        ChangeQueueConfig {
            buffer_time: Duration::from_millis(100),
            ..ChangeQueueConfig::default()
        },
        subscription,
        |_: &PropertyChange| true,
        recording_handler(batches.clone()),
        cancel.child(),
    ));

    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    worker.await.unwrap();

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1, "四次写入应聚并为一批");
    assert_eq!(
        batches[0],
        vec![
            ("level".to_owned(), PropertyValue::Integer(3)),
            ("label".to_owned(), PropertyValue::from("a")),
        ],
        "同一属性保留最后观测值，次序按首次出现"
    );
}

/// 来源标签等于处理器身份的变更被回环过滤；属性过滤器同样生效。
#[tokio::test(flavor = "multi_thread")]
async fn loopback_and_property_filters_apply() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, gauge_shape());
    let subscription = ctx.subscribe(256);

    {
        let _scope = SourceScope::enter(SourceTag::new("bridge-x"));
        subject.set("level", 1i64).unwrap();
    }
    subject.set("level", 2i64).unwrap();
    subject.set("label", "noisy").unwrap();

    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let cancel = Cancellation::new();
    let worker = tokio::spawn(ChangeQueueProcessor::run(
        ChangeQueueConfig {
            buffer_time: Duration::from_millis(100),
            source: Some(SourceTag::new("bridge-x")),
            ..ChangeQueueConfig::default()
        },
        subscription,
        |change: &PropertyChange| change.property().name() != "label",
        recording_handler(batches.clone()),
        cancel.child(),
    ));

    tokio::time::sleep(Duration::from_millis(600)).await;
    cancel.cancel();
    worker.await.unwrap();

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(
        batches[0],
        vec![("level".to_owned(), PropertyValue::Integer(2))],
        "回环与被过滤属性都不得出现在批次中"
    );
}

/// 投递失败后按重试间隔重投，最终成功。
#[tokio::test(flavor = "multi_thread")]
async fn failed_batches_are_retried() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, gauge_shape());
    let subscription = ctx.subscribe(256);
    subject.set("level", 7i64).unwrap();

    let attempts = Arc::new(Mutex::new(0usize));
    let delivered: Batches = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let attempts = attempts.clone();
        let delivered = delivered.clone();
        move |batch: Vec<PropertyChange>| {
            let attempts = attempts.clone();
            let delivered = delivered.clone();
            async move {
                let attempt = {
                    let mut guard = attempts.lock().unwrap();
                    *guard += 1;
                    *guard
                };
                if attempt < 3 {
                    return Err(CoreError::internal("simulated downstream outage"));
                }
                delivered.lock().unwrap().push(
                    batch
                        .iter()
                        .map(|c| (c.property().name().to_owned(), c.new_value().clone()))
                        .collect(),
                );
                Ok(())
            }
        }
    };

    let cancel = Cancellation::new();
    let worker = tokio::spawn(ChangeQueueProcessor::run(
        ChangeQueueConfig {
            buffer_time: Duration::from_millis(50),
            retry_time: Duration::from_millis(150),
            ..ChangeQueueConfig::default()
        },
        subscription,
        |_: &PropertyChange| true,
        handler,
        cancel.child(),
    ));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    cancel.cancel();
    worker.await.unwrap();

    assert!(*attempts.lock().unwrap() >= 3, "至少经历两次失败与一次成功");
    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1, "批次最终恰好送达一次");
    assert_eq!(
        delivered[0],
        vec![("level".to_owned(), PropertyValue::Integer(7))]
    );
}

/// 重试队列溢出丢最旧：容量 1 时仅最新批次存活。
#[tokio::test(flavor = "multi_thread")]
async fn retry_overflow_drops_oldest() {
    let ctx = SubjectContext::new();
    let subject = SubjectHandle::new(&ctx, gauge_shape());
    let subscription = ctx.subscribe(256);

    let failing = Arc::new(Mutex::new(true));
    let delivered: Batches = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let failing = failing.clone();
        let delivered = delivered.clone();
        move |batch: Vec<PropertyChange>| {
            let failing = failing.clone();
            let delivered = delivered.clone();
            async move {
                if *failing.lock().unwrap() {
                    return Err(CoreError::internal("still failing"));
                }
                delivered.lock().unwrap().push(
                    batch
                        .iter()
                        .map(|c| (c.property().name().to_owned(), c.new_value().clone()))
                        .collect(),
                );
                Ok(())
            }
        }
    };

    let cancel = Cancellation::new();
    let worker = tokio::spawn(ChangeQueueProcessor::run(
        ChangeQueueConfig {
            buffer_time: Duration::from_millis(50),
            retry_time: Duration::from_millis(400),
            write_retry_queue_size: 1,
            ..ChangeQueueConfig::default()
        },
        subscription,
        |_: &PropertyChange| true,
        handler,
        cancel.child(),
    ));

    // 第一批失败进入重试队列。
    subject.set("level", 1i64).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    // 第二批在重试等待期间到达：挤掉最旧的第一批。
    subject.set("level", 2i64).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    *failing.lock().unwrap() = false;
    tokio::time::sleep(Duration::from_millis(800)).await;
    cancel.cancel();
    worker.await.unwrap();

    let delivered = delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1, "容量为 1 的重试队列只保留一批");
    assert_eq!(
        delivered[0],
        vec![("level".to_owned(), PropertyValue::Integer(2))],
        "丢弃最旧、保留最新"
    );
}

/// 取消后处理器立即退出，待发缓冲按关停策略丢弃。
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_stops_the_processor() {
    let ctx = SubjectContext::new();
    let subscription = ctx.subscribe(16);
    let cancel = Cancellation::new();
    let worker = tokio::spawn(ChangeQueueProcessor::run(
        ChangeQueueConfig::default(),
        subscription,
        |_: &PropertyChange| true,
        |_batch: Vec<PropertyChange>| async move { Ok(()) },
        cancel.child(),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("取消后处理器必须在轮询间隔内退出")
        .unwrap();
}
