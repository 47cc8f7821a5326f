#![deny(unsafe_code)]
#![doc = "weave-bridge-ws: 主体更新协议的 WebSocket 桥。"]
#![doc = ""]
#![doc = "信封为 `[type, correlation-id-or-none, payload]` 三元组，编解码器可插拔"]
#![doc = "（默认 JSON）。服务端实现握手校验、先注册后欢迎、单调序号广播、心跳与"]
#![doc = "僵尸清扫；客户端实现无条件欢迎重同步、序号缺口检测与封顶退避重连。"]

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod server;

pub use client::WsSyncClient;
pub use config::WsBridgeConfig;
pub use envelope::{
    Envelope, EnvelopeCodec, ErrorPayload, HeartbeatPayload, HelloPayload, JsonCodec, Message,
    UpdatePayload, WelcomePayload,
};
pub use error::BridgeError;
pub use server::WsSyncServer;
