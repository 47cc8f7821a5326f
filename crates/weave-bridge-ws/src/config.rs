use std::time::Duration;

/// WebSocket 桥配置；默认值即协议契约的默认表。
///
/// `heartbeat_interval` 为零表示禁用心跳。
#[derive(Clone, Debug)]
pub struct WsBridgeConfig {
    /// 出站变更的聚并窗口。
    pub buffer_time: Duration,
    /// 出站批次投递失败后的重试间隔。
    pub retry_time: Duration,
    /// 在途重试队列容量。
    pub write_retry_queue_size: usize,
    /// 单条 WebSocket 消息大小上限（字节）。
    pub max_message_size: usize,
    /// 并发连接上限。
    pub max_connections: usize,
    /// 欢迎窗口内单连接可缓冲的广播条数；溢出即僵尸。
    pub max_pending_updates: usize,
    /// 等待 Hello 的时限。
    pub hello_timeout: Duration,
    /// 心跳间隔；零禁用。
    pub heartbeat_interval: Duration,
    /// 广播投递时限。
    pub broadcast_timeout: Duration,
    /// 协议版本。
    pub protocol_version: u32,
}

impl Default for WsBridgeConfig {
    fn default() -> Self {
        Self {
            buffer_time: Duration::from_millis(8),
            retry_time: Duration::from_secs(10),
            write_retry_queue_size: 16,
            max_message_size: 10 * 1024 * 1024,
            max_connections: 1000,
            max_pending_updates: 1000,
            hello_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::ZERO,
            broadcast_timeout: Duration::from_secs(5),
            protocol_version: 1,
        }
    }
}

impl WsBridgeConfig {
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    pub fn with_buffer_time(mut self, buffer_time: Duration) -> Self {
        self.buffer_time = buffer_time;
        self
    }
}
