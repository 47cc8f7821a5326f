//! WebSocket 主体协议服务端。
//!
//! # 教案级导览
//!
//! - **Why**：所有客户端必须对同一广播观察到相同的 `(序号, 载荷)`；
//!   欢迎快照必须与其携带的序号在同一瞬间一致；慢连接不得拖垮广播路径。
//! - **How**：一把状态锁串行化序号分配与快照构建（快照另在应用互斥的
//!   屏障内构建）；每连接一个写端任务串行化套接字发送；欢迎未决期间的
//!   广播进入每连接有界缓冲，欢迎后按 `序号 > welcome.sequence` 过滤排空。
//! - **What**：广播恰好递增序号一次并发往所有已欢迎连接（含来源连接，
//!   其回放在等值闸门上湮灭）；心跳报告当前序号不递增；单次套接字发送
//!   受广播投递时限约束，超时视同发送失败；连续三次发送失败或缓冲溢出
//!   的连接提升为僵尸，在下一轮清扫时移出广播集。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message as WsFrame;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use weave_core::bridge::SubjectFactory;
use weave_core::prelude::*;
use weave_core::update::create_partial_from_changes;

use crate::config::WsBridgeConfig;
use crate::envelope::{
    Envelope, EnvelopeCodec, ErrorPayload, HeartbeatPayload, JsonCodec, Message, UpdatePayload,
    WelcomePayload,
};
use crate::error::{BridgeError, codes};

const CANCEL_POLL: Duration = Duration::from_millis(250);
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const ZOMBIE_FAILURE_LIMIT: u32 = 3;

struct Connection {
    id: u64,
    tx: mpsc::Sender<WsFrame>,
    welcomed: bool,
    buffered: VecDeque<(u64, WsFrame)>,
    failures: u32,
    zombie: bool,
}

struct BroadcastState {
    sequence: u64,
    next_conn_id: u64,
    connections: Vec<Connection>,
}

struct ServerInner {
    config: WsBridgeConfig,
    ctx: SubjectContext,
    root: SubjectHandle,
    factory: Arc<dyn SubjectFactory>,
    codec: Arc<dyn EnvelopeCodec>,
    state: Mutex<BroadcastState>,
    cancel: Cancellation,
}

/// 主体协议的 WebSocket 服务端。克隆即共享。
#[derive(Clone)]
pub struct WsSyncServer {
    inner: Arc<ServerInner>,
}

impl WsSyncServer {
    pub fn new(
        ctx: SubjectContext,
        root: SubjectHandle,
        factory: Arc<dyn SubjectFactory>,
        config: WsBridgeConfig,
    ) -> Self {
        Self::with_codec(ctx, root, factory, config, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        ctx: SubjectContext,
        root: SubjectHandle,
        factory: Arc<dyn SubjectFactory>,
        config: WsBridgeConfig,
        codec: Arc<dyn EnvelopeCodec>,
    ) -> Self {
        ctx.attach_root(&root);
        Self {
            inner: Arc::new(ServerInner {
                config,
                ctx,
                root,
                factory,
                codec,
                state: Mutex::new(BroadcastState {
                    sequence: 0,
                    next_conn_id: 1,
                    connections: Vec::new(),
                }),
                cancel: Cancellation::new(),
            }),
        }
    }

    /// 宿主生命周期的取消令牌；取消后接受循环、广播泵与心跳一并退出。
    pub fn cancellation(&self) -> Cancellation {
        self.inner.cancel.child()
    }

    /// 触发关停。
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// 当前广播序号（测试与诊断用）。
    pub fn sequence(&self) -> u64 {
        self.inner.state.lock().sequence
    }

    /// 当前广播集大小（不含僵尸）。
    pub fn connection_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .filter(|c| !c.zombie)
            .count()
    }

    /// 在已绑定的监听器上运行服务端直至取消。
    pub async fn run(self, listener: TcpListener) -> Result<(), BridgeError> {
        let pump = {
            let server = self.clone();
            let subscription = self.inner.ctx.subscribe(self.inner.config.max_pending_updates);
            let queue_config = ChangeQueueConfig {
                buffer_time: self.inner.config.buffer_time,
                retry_time: self.inner.config.retry_time,
                write_retry_queue_size: self.inner.config.write_retry_queue_size,
                source: Some(SourceTag::new("ws-server")),
                ..ChangeQueueConfig::default()
            };
            tokio::spawn(ChangeQueueProcessor::run(
                queue_config,
                subscription,
                |_: &PropertyChange| true,
                move |batch: Vec<PropertyChange>| {
                    let server = server.clone();
                    async move {
                        server.broadcast(batch);
                        Ok(())
                    }
                },
                self.inner.cancel.child(),
            ))
        };

        let heartbeat = if self.inner.config.heartbeat_interval > Duration::ZERO {
            let server = self.clone();
            let interval = self.inner.config.heartbeat_interval;
            Some(tokio::spawn(async move {
                let mut ticker = time::interval(interval);
                ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if server.inner.cancel.is_cancelled() {
                        break;
                    }
                    server.heartbeat();
                }
            }))
        } else {
            None
        };

        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            let accepted = match time::timeout(CANCEL_POLL, listener.accept()).await {
                Err(_) => continue,
                Ok(Err(err)) => {
                    tracing::warn!(target: "weave.bridge.ws", error = %err, "accept failed");
                    continue;
                }
                Ok(Ok(accepted)) => accepted,
            };
            let (stream, peer) = accepted;
            if self.connection_count() >= self.inner.config.max_connections {
                tracing::warn!(
                    target: "weave.bridge.ws",
                    %peer,
                    limit = self.inner.config.max_connections,
                    "connection limit reached, rejecting"
                );
                drop(stream);
                continue;
            }
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream).await;
            });
        }

        self.close_all();
        pump.abort();
        if let Some(heartbeat) = heartbeat {
            heartbeat.abort();
        }
        Ok(())
    }

    /// 广播一批变更：构建部分快照、递增序号恰好一次、投递到广播集。
    fn broadcast(&self, batch: Vec<PropertyChange>) {
        let update = create_partial_from_changes(&self.inner.ctx, &self.inner.root, &batch);
        if update.subjects.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        state.sequence += 1;
        let sequence = state.sequence;
        let envelope = Envelope::new(Message::Update(UpdatePayload { update, sequence }));
        let frame = match self.encode(&envelope) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!(target: "weave.bridge.ws", error = %err, "broadcast encode failed");
                return;
            }
        };
        // 清扫：上一轮提升的僵尸在此移出广播集。
        state
            .connections
            .retain(|conn| !conn.zombie && !conn.tx.is_closed());
        let max_pending = self.inner.config.max_pending_updates;
        for conn in state.connections.iter_mut() {
            if conn.welcomed {
                deliver(conn, frame.clone());
            } else if conn.buffered.len() >= max_pending {
                conn.zombie = true;
                tracing::warn!(
                    target: "weave.bridge.ws",
                    connection = conn.id,
                    "pending buffer overflow during welcome window, marking zombie"
                );
            } else {
                conn.buffered.push_back((sequence, frame.clone()));
            }
        }
    }

    /// 心跳：报告当前序号，不递增；静默期内连续心跳序号相等。
    fn heartbeat(&self) {
        let mut state = self.inner.state.lock();
        let sequence = state.sequence;
        let envelope = Envelope::new(Message::Heartbeat(HeartbeatPayload { sequence }));
        let frame = match self.encode(&envelope) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        state
            .connections
            .retain(|conn| !conn.zombie && !conn.tx.is_closed());
        for conn in state.connections.iter_mut() {
            if conn.welcomed {
                deliver(conn, frame.clone());
            }
        }
    }

    fn register_connection(&self, tx: mpsc::Sender<WsFrame>) -> u64 {
        let mut state = self.inner.state.lock();
        let id = state.next_conn_id;
        state.next_conn_id += 1;
        state.connections.push(Connection {
            id,
            tx,
            welcomed: false,
            buffered: VecDeque::new(),
            failures: 0,
            zombie: false,
        });
        tracing::debug!(target: "weave.bridge.ws", connection = id, "connection registered");
        id
    }

    fn remove_connection(&self, conn_id: u64) {
        let mut state = self.inner.state.lock();
        state.connections.retain(|conn| conn.id != conn_id);
    }

    /// 构建欢迎帧与“欢迎后补投”的缓冲帧。
    ///
    /// 状态锁与应用屏障同时生效：快照构建期间序号不得推进、入站应用
    /// 不得改图，`welcome.sequence` 即快照瞬间的服务端序号。
    fn welcome_for(&self, conn_id: u64) -> Result<(WsFrame, Vec<WsFrame>), BridgeError> {
        let mut state = self.inner.state.lock();
        let snapshot = self
            .inner
            .ctx
            .with_apply_barrier(|| create_complete(&self.inner.ctx, &self.inner.root))?;
        let sequence = state.sequence;
        let envelope = Envelope::new(Message::Welcome(WelcomePayload {
            version: self.inner.config.protocol_version,
            format: self.inner.codec.format().to_owned(),
            state: snapshot,
            sequence,
        }));
        let welcome = self.encode(&envelope)?;
        let conn = state
            .connections
            .iter_mut()
            .find(|conn| conn.id == conn_id)
            .ok_or_else(|| BridgeError::Protocol("connection vanished before welcome".into()))?;
        conn.welcomed = true;
        let drained = conn
            .buffered
            .drain(..)
            .filter(|(seq, _)| *seq > sequence)
            .map(|(_, frame)| frame)
            .collect();
        Ok((welcome, drained))
    }

    fn apply_inbound(&self, conn_id: u64, payload: &UpdatePayload) -> Result<(), CoreError> {
        // 入站序号不参与服务端排序：广播序号由服务端重新签发。
        weave_core::update::apply(
            &self.inner.ctx,
            &self.inner.root,
            &payload.update,
            ApplyOptions {
                source: Some(SourceTag::new(format!("ws-conn:{conn_id}"))),
                factory: Some(self.inner.factory.as_ref()),
            },
        )
    }

    fn encode(&self, envelope: &Envelope) -> Result<WsFrame, BridgeError> {
        let bytes = self.inner.codec.encode(envelope)?;
        Ok(WsFrame::Binary(bytes.into()))
    }

    fn error_frame(&self, code: &str, message: &str) -> Option<WsFrame> {
        self.encode(&Envelope::new(Message::Error(ErrorPayload {
            code: code.to_owned(),
            message: message.to_owned(),
        })))
        .ok()
    }

    fn close_all(&self) {
        let mut state = self.inner.state.lock();
        for conn in state.connections.iter() {
            let _ = conn.tx.try_send(WsFrame::Close(None));
        }
        state.connections.clear();
    }

    async fn handle_connection(self, stream: TcpStream) {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.inner.config.max_message_size))
            .max_frame_size(Some(self.inner.config.max_message_size));
        let ws = match accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(err) => {
                tracing::debug!(target: "weave.bridge.ws", error = %err, "websocket handshake failed");
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::channel::<WsFrame>(self.inner.config.max_pending_updates.max(1));

        // 每连接唯一的写端任务：串行化该套接字上的所有发送，
        // 并以广播投递时限约束每一次发送；超时视同发送失败，
        // 连接随写端退出进入僵尸清扫路径。
        let broadcast_timeout = self.inner.config.broadcast_timeout;
        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, WsFrame::Close(_));
                match time::timeout(broadcast_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(
                            target: "weave.bridge.ws",
                            timeout = ?broadcast_timeout,
                            "send exceeded broadcast deadline, dropping connection"
                        );
                        break;
                    }
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // 握手：限时等待 Hello；违例即 Error + Close。
        let hello = match time::timeout(
            self.inner.config.hello_timeout,
            next_envelope(&mut stream, self.inner.codec.as_ref()),
        )
        .await
        {
            Err(_) => {
                if let Some(frame) = self.error_frame(codes::TIMEOUT, "hello not received in time")
                {
                    let _ = tx.send(frame).await;
                }
                finish_writer(tx, writer).await;
                return;
            }
            Ok(Err(err)) => {
                if let Some(frame) = self.error_frame(codes::INVALID_FORMAT, &err.to_string()) {
                    let _ = tx.send(frame).await;
                }
                finish_writer(tx, writer).await;
                return;
            }
            Ok(Ok(None)) => {
                finish_writer(tx, writer).await;
                return;
            }
            Ok(Ok(Some(envelope))) => match envelope.message {
                Message::Hello(hello) => hello,
                _ => {
                    if let Some(frame) =
                        self.error_frame(codes::INVALID_FORMAT, "expected hello envelope")
                    {
                        let _ = tx.send(frame).await;
                    }
                    finish_writer(tx, writer).await;
                    return;
                }
            },
        };
        if hello.version != self.inner.config.protocol_version {
            if let Some(frame) = self.error_frame(
                codes::VERSION_MISMATCH,
                &format!(
                    "version {} is not supported, expected {}",
                    hello.version, self.inner.config.protocol_version
                ),
            ) {
                let _ = tx.send(frame).await;
            }
            finish_writer(tx, writer).await;
            return;
        }

        // 先注册进广播集，再序列化欢迎快照：与快照并发的广播会进入
        // 本连接的缓冲，欢迎后按序号过滤补投。
        let conn_id = self.register_connection(tx.clone());
        match self.welcome_for(conn_id) {
            Ok((welcome, drained)) => {
                if tx.send(welcome).await.is_err() {
                    self.remove_connection(conn_id);
                    finish_writer(tx, writer).await;
                    return;
                }
                for frame in drained {
                    let _ = tx.send(frame).await;
                }
            }
            Err(err) => {
                tracing::error!(
                    target: "weave.bridge.ws",
                    connection = conn_id,
                    error = %err,
                    "welcome snapshot failed"
                );
                self.remove_connection(conn_id);
                finish_writer(tx, writer).await;
                return;
            }
        }

        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            let frame = match time::timeout(CANCEL_POLL, stream.next()).await {
                Err(_) => continue,
                // 对端断开或中止：直接丢弃连接，不发错误。
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(frame))) => frame,
            };
            let bytes = match frame {
                WsFrame::Binary(bytes) => bytes,
                WsFrame::Text(text) => bytes::Bytes::from(text.as_str().as_bytes().to_vec()),
                WsFrame::Close(_) => break,
                _ => continue,
            };
            match self.inner.codec.decode(&bytes) {
                Ok(Envelope {
                    message: Message::Update(payload),
                    ..
                }) => {
                    if let Err(err) = self.apply_inbound(conn_id, &payload) {
                        // 对端只收到泛化描述；完整原因落在服务端日志。
                        tracing::error!(
                            target: "weave.bridge.ws",
                            connection = conn_id,
                            error = %err,
                            "inbound update failed"
                        );
                        if let Some(frame) =
                            self.error_frame(codes::INTERNAL, "failed to apply update")
                        {
                            let _ = tx.send(frame).await;
                        }
                    }
                }
                Ok(envelope) => {
                    if let Some(frame) = self.error_frame(
                        codes::INVALID_FORMAT,
                        &format!("unexpected `{}` envelope", envelope.message.type_name()),
                    ) {
                        let _ = tx.send(frame).await;
                    }
                    time::sleep(Duration::from_millis(100)).await;
                    break;
                }
                Err(err) => {
                    if let Some(frame) = self.error_frame(codes::INVALID_FORMAT, &err.to_string())
                    {
                        let _ = tx.send(frame).await;
                    }
                    time::sleep(Duration::from_millis(100)).await;
                    break;
                }
            }
        }

        self.remove_connection(conn_id);
        finish_writer(tx, writer).await;
    }
}

/// 投递一帧到已欢迎连接：满通道计一次失败，连续三次提升僵尸；
/// 成功清零计数。
fn deliver(conn: &mut Connection, frame: WsFrame) {
    match conn.tx.try_send(frame) {
        Ok(()) => conn.failures = 0,
        Err(mpsc::error::TrySendError::Full(_)) => {
            conn.failures += 1;
            if conn.failures >= ZOMBIE_FAILURE_LIMIT {
                conn.zombie = true;
                tracing::warn!(
                    target: "weave.bridge.ws",
                    connection = conn.id,
                    failures = conn.failures,
                    "consecutive send failures, marking zombie"
                );
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            conn.zombie = true;
        }
    }
}

/// 读取并解码下一条信封；`None` 表示对端关闭。
pub(crate) async fn next_envelope(
    stream: &mut (impl futures_util::Stream<Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    codec: &dyn EnvelopeCodec,
) -> Result<Option<Envelope>, BridgeError> {
    loop {
        match stream.next().await {
            None => return Ok(None),
            Some(Err(err)) => return Err(BridgeError::transport(err)),
            Some(Ok(WsFrame::Binary(bytes))) => return codec.decode(&bytes).map(Some),
            Some(Ok(WsFrame::Text(text))) => {
                return codec.decode(text.as_str().as_bytes()).map(Some);
            }
            Some(Ok(WsFrame::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
        }
    }
}

/// 丢下发送端并在宽限时限内等待写端任务收尾。
async fn finish_writer(tx: mpsc::Sender<WsFrame>, writer: tokio::task::JoinHandle<()>) {
    drop(tx);
    if time::timeout(CLOSE_GRACE, writer).await.is_err() {
        tracing::debug!(target: "weave.bridge.ws", "writer exceeded close grace period");
    }
}
