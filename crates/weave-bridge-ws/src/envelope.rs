//! 三元组信封 `[type, correlation-id-or-none, payload]` 与可插拔编解码器。
//!
//! # 教案级导览
//!
//! - **Why**：信封形状与载荷编码解耦，线上格式由编解码器决定
//!   （默认 JSON），桥逻辑对格式保持无感。
//! - **How**：消息以带类型名的枚举建模；编解码器把 `(类型名, 关联 id,
//!   载荷)` 压成字节、或从字节还原。未知类型名与畸形结构一律判为
//!   `invalid_format`。
//! - **What**：编码必须可逆：`decode(encode(e)) == e`。

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use weave_core::update::SubjectUpdate;

use crate::error::BridgeError;

/// Hello：客户端宣告版本与期望格式。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub version: u32,
    pub format: String,
}

/// Welcome：服务端回应初始状态与当前序号。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub version: u32,
    pub format: String,
    pub state: SubjectUpdate,
    pub sequence: u64,
}

/// Update：双向的部分/完整快照，广播方向携带服务端序号。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    #[serde(flatten)]
    pub update: SubjectUpdate,
    pub sequence: u64,
}

/// Heartbeat：报告当前序号，不递增。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub sequence: u64,
}

/// Error：携带稳定错误码与描述。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// 协议消息。
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello(HelloPayload),
    Welcome(WelcomePayload),
    Update(UpdatePayload),
    Heartbeat(HeartbeatPayload),
    Error(ErrorPayload),
}

impl Message {
    /// 信封首元素的稳定类型名。
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Welcome(_) => "welcome",
            Self::Update(_) => "update",
            Self::Heartbeat(_) => "heartbeat",
            Self::Error(_) => "error",
        }
    }
}

/// 一条完整信封。
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub correlation: Option<u64>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            correlation: None,
        }
    }
}

/// 可插拔信封编解码器。
pub trait EnvelopeCodec: Send + Sync {
    /// 线上格式名，在 Hello/Welcome 中回显。
    fn format(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, BridgeError>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, BridgeError>;
}

/// 默认 JSON 编解码器。
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, BridgeError> {
        let payload = match &envelope.message {
            Message::Hello(p) => serde_json::to_value(p),
            Message::Welcome(p) => serde_json::to_value(p),
            Message::Update(p) => serde_json::to_value(p),
            Message::Heartbeat(p) => serde_json::to_value(p),
            Message::Error(p) => serde_json::to_value(p),
        }
        .map_err(BridgeError::codec)?;
        let frame = json!([envelope.message.type_name(), envelope.correlation, payload]);
        serde_json::to_vec(&frame).map_err(BridgeError::codec)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, BridgeError> {
        let frame: Value = serde_json::from_slice(bytes).map_err(BridgeError::codec)?;
        let Value::Array(parts) = frame else {
            return Err(BridgeError::Protocol("envelope is not a 3-tuple".into()));
        };
        if parts.len() != 3 {
            return Err(BridgeError::Protocol(format!(
                "envelope has {} elements, expected 3",
                parts.len()
            )));
        }
        let mut parts = parts.into_iter();
        let kind = match parts.next() {
            Some(Value::String(kind)) => kind,
            _ => return Err(BridgeError::Protocol("envelope type must be a string".into())),
        };
        let correlation = match parts.next() {
            Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_u64(),
            _ => {
                return Err(BridgeError::Protocol(
                    "correlation id must be a number or null".into(),
                ));
            }
        };
        let payload = parts.next().unwrap_or(Value::Null);
        let message = match kind.as_str() {
            "hello" => Message::Hello(serde_json::from_value(payload).map_err(BridgeError::codec)?),
            "welcome" => {
                Message::Welcome(serde_json::from_value(payload).map_err(BridgeError::codec)?)
            }
            "update" => {
                Message::Update(serde_json::from_value(payload).map_err(BridgeError::codec)?)
            }
            "heartbeat" => {
                Message::Heartbeat(serde_json::from_value(payload).map_err(BridgeError::codec)?)
            }
            "error" => Message::Error(serde_json::from_value(payload).map_err(BridgeError::codec)?),
            other => {
                return Err(BridgeError::Protocol(format!(
                    "unknown envelope type `{other}`"
                )));
            }
        };
        Ok(Envelope {
            message,
            correlation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 信封编码可逆，且首元素为类型名。
    #[test]
    fn json_envelope_roundtrip() {
        let codec = JsonCodec;
        let envelope = Envelope::new(Message::Heartbeat(HeartbeatPayload { sequence: 42 }));
        let bytes = codec.encode(&envelope).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("[\"heartbeat\""), "信封首元素是类型名: {text}");
        assert_eq!(codec.decode(&bytes).unwrap(), envelope);
    }

    /// 畸形信封判为协议违例。
    #[test]
    fn malformed_envelope_is_rejected() {
        let codec = JsonCodec;
        assert!(codec.decode(b"{\"not\":\"a tuple\"}").is_err());
        assert!(codec.decode(b"[\"unknown-type\", null, {}]").is_err());
        assert!(codec.decode(b"[1, 2]").is_err());
    }
}
