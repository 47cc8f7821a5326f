//! WebSocket 主体协议客户端。
//!
//! # 教案级导览
//!
//! - **Why**：客户端对服务端状态只承诺最终一致：欢迎快照无条件重同步，
//!   序号缺口触发断连重连，本地写经出站泵上送且不回声。
//! - **How**：会话循环 = 连接 → Hello/Welcome 握手 → 应用初始状态 →
//!   并行运行出站泵与读循环。入站应用以本客户端的来源标签落盘，
//!   出站泵按同一标签过滤，回环在队列层湮灭。
//! - **What**：收到序号 `> last + 1` 的广播或心跳报告超过 `last` 的序号
//!   即重同步；重连采用封顶指数退避；取消令牌随宿主生命周期传播。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use weave_core::bridge::SubjectFactory;
use weave_core::prelude::*;

use crate::config::WsBridgeConfig;
use crate::envelope::{
    Envelope, EnvelopeCodec, HelloPayload, JsonCodec, Message, UpdatePayload, WelcomePayload,
};
use crate::error::BridgeError;
use crate::server::next_envelope;

const CANCEL_POLL: Duration = Duration::from_millis(250);
const BACKOFF_FLOOR: Duration = Duration::from_millis(200);
const BACKOFF_CEILING: Duration = Duration::from_secs(5);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// 一次会话的结束方式；序号缺口在会话收尾后以
/// [`BridgeError::SequenceGap`] 浮出。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Disconnected,
    Resync,
}

struct ClientInner {
    config: WsBridgeConfig,
    url: String,
    ctx: SubjectContext,
    root: SubjectHandle,
    factory: Arc<dyn SubjectFactory>,
    codec: Arc<dyn EnvelopeCodec>,
    cancel: Cancellation,
    source: SourceTag,
    outbound_seq: AtomicU64,
}

/// 主体协议的 WebSocket 客户端。克隆即共享。
#[derive(Clone)]
pub struct WsSyncClient {
    inner: Arc<ClientInner>,
}

impl WsSyncClient {
    pub fn new(
        ctx: SubjectContext,
        root: SubjectHandle,
        factory: Arc<dyn SubjectFactory>,
        url: impl Into<String>,
        config: WsBridgeConfig,
    ) -> Self {
        Self::with_codec(ctx, root, factory, url, config, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        ctx: SubjectContext,
        root: SubjectHandle,
        factory: Arc<dyn SubjectFactory>,
        url: impl Into<String>,
        config: WsBridgeConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        ctx.attach_root(&root);
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(ClientInner {
                config,
                url: url.into(),
                ctx,
                root,
                factory,
                codec,
                cancel: Cancellation::new(),
                source: SourceTag::new(format!("ws-client:{client_id}")),
                outbound_seq: AtomicU64::new(0),
            }),
        }
    }

    /// 宿主生命周期的取消令牌。
    pub fn cancellation(&self) -> Cancellation {
        self.inner.cancel.child()
    }

    /// 触发关停。
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// 连接并保持同步直至取消；断连与序号缺口按封顶退避自动重连，
    /// 每次重连都无条件从新的欢迎快照重同步。
    pub async fn run(&self) -> Result<(), BridgeError> {
        let mut backoff = BACKOFF_FLOOR;
        loop {
            if self.inner.cancel.is_cancelled() {
                return Ok(());
            }
            match self.session().await {
                Ok(SessionEnd::Cancelled) => return Ok(()),
                Ok(end) => {
                    tracing::info!(
                        target: "weave.bridge.ws",
                        url = self.inner.url.as_str(),
                        reason = ?end,
                        "session ended, reconnecting"
                    );
                    backoff = BACKOFF_FLOOR;
                }
                Err(BridgeError::SequenceGap) => {
                    tracing::info!(
                        target: "weave.bridge.ws",
                        url = self.inner.url.as_str(),
                        "sequence gap, resyncing from a fresh welcome"
                    );
                    backoff = BACKOFF_FLOOR;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "weave.bridge.ws",
                        url = self.inner.url.as_str(),
                        error = %err,
                        "session failed, backing off"
                    );
                }
            }
            self.sleep_cancellable(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_CEILING);
        }
    }

    async fn sleep_cancellable(&self, duration: Duration) {
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(50);
        while waited < duration && !self.inner.cancel.is_cancelled() {
            time::sleep(step).await;
            waited += step;
        }
    }

    async fn session(&self) -> Result<SessionEnd, BridgeError> {
        let (ws, _) = connect_async(&self.inner.url)
            .await
            .map_err(BridgeError::transport)?;
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<WsFrame>(self.inner.config.max_pending_updates.max(1));
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let hello = Envelope::new(Message::Hello(HelloPayload {
            version: self.inner.config.protocol_version,
            format: self.inner.codec.format().to_owned(),
        }));
        let hello_frame = WsFrame::Binary(self.inner.codec.encode(&hello)?.into());
        tx.send(hello_frame)
            .await
            .map_err(|_| BridgeError::transport("writer closed during hello"))?;

        let welcome = match time::timeout(
            self.inner.config.hello_timeout,
            self.await_welcome(&mut stream),
        )
        .await
        {
            Err(_) => return Err(BridgeError::Timeout("welcome")),
            Ok(result) => result?,
        };
        if welcome.version != self.inner.config.protocol_version {
            return Err(BridgeError::VersionMismatch {
                expected: self.inner.config.protocol_version,
                actual: welcome.version,
            });
        }

        // 订阅先于初始应用建立：应用产生的变更带本客户端标签，
        // 被出站泵的回环过滤吸收。
        let subscription = self
            .inner
            .ctx
            .subscribe(self.inner.config.max_pending_updates.max(16));
        self.apply_update(&welcome.state)?;
        let mut last_sequence = welcome.sequence;

        let session_cancel = Cancellation::new();
        let pump = {
            let client = self.clone();
            let pump_tx = tx.clone();
            let queue_config = ChangeQueueConfig {
                buffer_time: self.inner.config.buffer_time,
                retry_time: self.inner.config.retry_time,
                write_retry_queue_size: self.inner.config.write_retry_queue_size,
                source: Some(self.inner.source.clone()),
                ..ChangeQueueConfig::default()
            };
            tokio::spawn(ChangeQueueProcessor::run(
                queue_config,
                subscription,
                |_: &PropertyChange| true,
                move |batch: Vec<PropertyChange>| {
                    let client = client.clone();
                    let tx = pump_tx.clone();
                    async move { client.send_outbound(batch, tx).await }
                },
                session_cancel.child(),
            ))
        };

        let end = loop {
            if self.inner.cancel.is_cancelled() {
                break SessionEnd::Cancelled;
            }
            let envelope = match time::timeout(CANCEL_POLL, next_envelope(
                &mut stream,
                self.inner.codec.as_ref(),
            ))
            .await
            {
                Err(_) => continue,
                Ok(Ok(None)) => break SessionEnd::Disconnected,
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "weave.bridge.ws",
                        error = %err,
                        "inbound envelope malformed, dropping session"
                    );
                    break SessionEnd::Disconnected;
                }
                Ok(Ok(Some(envelope))) => envelope,
            };
            match envelope.message {
                Message::Update(payload) => {
                    if payload.sequence <= last_sequence {
                        continue;
                    }
                    if payload.sequence > last_sequence + 1 {
                        tracing::info!(
                            target: "weave.bridge.ws",
                            expected = last_sequence + 1,
                            received = payload.sequence,
                            "sequence gap detected"
                        );
                        break SessionEnd::Resync;
                    }
                    if let Err(err) = self.apply_update(&payload.update) {
                        tracing::error!(
                            target: "weave.bridge.ws",
                            error = %err,
                            "failed to apply broadcast, dropping session"
                        );
                        break SessionEnd::Disconnected;
                    }
                    last_sequence = payload.sequence;
                }
                Message::Heartbeat(payload) => {
                    // 静默期心跳序号与 last 相等是正常的；大于 last 说明
                    // 有广播丢失。
                    if payload.sequence > last_sequence {
                        break SessionEnd::Resync;
                    }
                }
                Message::Error(payload) => {
                    tracing::warn!(
                        target: "weave.bridge.ws",
                        code = payload.code.as_str(),
                        message = payload.message.as_str(),
                        "server reported error"
                    );
                    break SessionEnd::Disconnected;
                }
                other => {
                    tracing::warn!(
                        target: "weave.bridge.ws",
                        kind = other.type_name(),
                        "unexpected envelope, dropping session"
                    );
                    break SessionEnd::Disconnected;
                }
            }
        };

        session_cancel.cancel();
        pump.abort();
        drop(tx);
        if time::timeout(Duration::from_secs(2), writer).await.is_err() {
            tracing::debug!(target: "weave.bridge.ws", "writer exceeded close grace period");
        }
        if end == SessionEnd::Resync {
            return Err(BridgeError::SequenceGap);
        }
        Ok(end)
    }

    async fn await_welcome(
        &self,
        stream: &mut (impl futures_util::Stream<
            Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
    ) -> Result<WelcomePayload, BridgeError> {
        loop {
            match next_envelope(stream, self.inner.codec.as_ref()).await? {
                None => return Err(BridgeError::transport("closed before welcome")),
                Some(Envelope {
                    message: Message::Welcome(payload),
                    ..
                }) => return Ok(payload),
                Some(Envelope {
                    message: Message::Error(payload),
                    ..
                }) => {
                    return Err(BridgeError::Protocol(format!(
                        "{}: {}",
                        payload.code, payload.message
                    )));
                }
                Some(_) => continue,
            }
        }
    }

    fn apply_update(&self, update: &SubjectUpdate) -> Result<(), CoreError> {
        weave_core::update::apply(
            &self.inner.ctx,
            &self.inner.root,
            update,
            ApplyOptions {
                source: Some(self.inner.source.clone()),
                factory: Some(self.inner.factory.as_ref()),
            },
        )
    }

    async fn send_outbound(
        &self,
        batch: Vec<PropertyChange>,
        tx: mpsc::Sender<WsFrame>,
    ) -> Result<(), CoreError> {
        let update = create_partial_from_changes(&self.inner.ctx, &self.inner.root, &batch);
        if update.subjects.is_empty() {
            return Ok(());
        }
        let sequence = self.inner.outbound_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = Envelope::new(Message::Update(UpdatePayload { update, sequence }));
        let bytes = self
            .inner
            .codec
            .encode(&envelope)
            .map_err(|err| CoreError::internal(err.to_string()))?;
        tx.send(WsFrame::Binary(bytes.into()))
            .await
            .map_err(|_| CoreError::internal("session writer closed"))
    }
}
