//! 变更队列处理器：从变更流到下游桥的去抖、成批与背压。
//!
//! # 教案级导览
//!
//! - **Why**：桥的写出端吞吐远低于图的写入热路径；以缓冲窗口聚并、
//!   逐批顺序投递与有界重试队列把两侧解耦。
//! - **How**：窗口内对同一属性只保留最后观测值（状态同步语义下足够）。
//!   批次严格顺序投递：上一批处理器未返回前不组装下一批；前序批次尚在
//!   重试时，新批次直接追加到重试队列尾部以保持次序。
//! - **What**：重试队列容量 `write_retry_queue_size`，溢出时丢弃最旧批次
//!   并记录告警；来源标签等于本处理器身份的变更被过滤（回环抑制）；
//!   取消后待发缓冲按关停策略丢弃。

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::time;

use crate::contract::Cancellation;
use crate::error::CoreError;
use crate::subject::PropertyKey;
use crate::tracking::change::{PropertyChange, SourceTag};
use crate::tracking::stream::ChangeSubscription;

/// 队列处理器参数。
#[derive(Clone, Debug)]
pub struct ChangeQueueConfig {
    /// 聚并窗口。
    pub buffer_time: Duration,
    /// 单批最大变更条数。
    pub max_batch_size: usize,
    /// 投递失败后的重试间隔。
    pub retry_time: Duration,
    /// 在途重试队列容量；溢出丢最旧并告警。
    pub write_retry_queue_size: usize,
    /// 本处理器的来源身份；与之相等的变更被回环过滤。
    pub source: Option<SourceTag>,
    /// 空闲时的取消轮询间隔。
    pub poll_interval: Duration,
}

impl Default for ChangeQueueConfig {
    fn default() -> Self {
        Self {
            buffer_time: Duration::from_millis(8),
            max_batch_size: 256,
            retry_time: Duration::from_secs(10),
            write_retry_queue_size: 16,
            source: None,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// 批处理器：接收一批变更，可能失败。
pub trait BatchHandler: Send {
    type Fut: Future<Output = Result<(), CoreError>> + Send;

    fn deliver(&mut self, batch: Vec<PropertyChange>) -> Self::Fut;
}

impl<F, Fut> BatchHandler for F
where
    F: FnMut(Vec<PropertyChange>) -> Fut + Send,
    Fut: Future<Output = Result<(), CoreError>> + Send,
{
    type Fut = Fut;

    fn deliver(&mut self, batch: Vec<PropertyChange>) -> Self::Fut {
        self(batch)
    }
}

/// 变更队列处理器。
pub struct ChangeQueueProcessor;

impl ChangeQueueProcessor {
    /// 消费订阅直至取消或流关闭。
    pub async fn run<H, P>(
        config: ChangeQueueConfig,
        mut subscription: ChangeSubscription,
        mut property_filter: P,
        mut handler: H,
        cancel: Cancellation,
    ) where
        H: BatchHandler,
        P: FnMut(&PropertyChange) -> bool + Send,
    {
        let mut retry: VecDeque<Vec<PropertyChange>> = VecDeque::new();
        let mut retry_due: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Some(due) = retry_due {
                if Instant::now() >= due {
                    retry_due = None;
                    while let Some(batch) = retry.pop_front() {
                        if cancel.is_cancelled() {
                            return;
                        }
                        match handler.deliver(batch.clone()).await {
                            Ok(()) => {}
                            Err(err) => {
                                tracing::warn!(
                                    target: "weave.queue",
                                    error = %err,
                                    pending = retry.len() + 1,
                                    "batch delivery failed, scheduling retry"
                                );
                                retry.push_front(batch);
                                retry_due = Some(Instant::now() + config.retry_time);
                                break;
                            }
                        }
                    }
                }
            }

            let first = match time::timeout(config.poll_interval, subscription.recv()).await {
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(change)) => change,
            };

            let mut batch: Vec<PropertyChange> = Vec::new();
            let mut positions: HashMap<PropertyKey, usize> = HashMap::new();
            coalesce(&mut batch, &mut positions, first);
            let window_end = Instant::now() + config.buffer_time;
            while batch.len() < config.max_batch_size {
                let remaining = window_end.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match time::timeout(remaining, subscription.recv()).await {
                    Ok(Some(change)) => coalesce(&mut batch, &mut positions, change),
                    Ok(None) | Err(_) => break,
                }
            }

            batch.retain(|change| {
                let looped = matches!(
                    (change.source(), config.source.as_ref()),
                    (Some(origin), Some(own)) if origin == own
                );
                !looped && property_filter(change)
            });
            if batch.is_empty() {
                continue;
            }

            if !retry.is_empty() || retry_due.is_some() {
                enqueue_retry(&mut retry, batch, config.write_retry_queue_size);
                continue;
            }

            match handler.deliver(batch.clone()).await {
                Ok(()) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "weave.queue",
                        error = %err,
                        "batch delivery failed, scheduling retry"
                    );
                    enqueue_retry(&mut retry, batch, config.write_retry_queue_size);
                    retry_due = Some(Instant::now() + config.retry_time);
                }
            }
        }
    }
}

/// 窗口内聚并：同一属性保留最后观测值，保持首次出现的位置。
fn coalesce(
    batch: &mut Vec<PropertyChange>,
    positions: &mut HashMap<PropertyKey, usize>,
    change: PropertyChange,
) {
    let key = change.property().key();
    match positions.get(&key) {
        Some(&pos) => batch[pos] = change,
        None => {
            positions.insert(key, batch.len());
            batch.push(change);
        }
    }
}

fn enqueue_retry(
    retry: &mut VecDeque<Vec<PropertyChange>>,
    batch: Vec<PropertyChange>,
    capacity: usize,
) {
    retry.push_back(batch);
    while retry.len() > capacity.max(1) {
        retry.pop_front();
        tracing::warn!(
            target: "weave.queue",
            capacity,
            "retry queue overflow, dropping oldest batch"
        );
    }
}
