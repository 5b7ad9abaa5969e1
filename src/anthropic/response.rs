//! 后端响应的统一表示
//!
//! 流式与非流式是两个互斥的变体，调用方 `match` 取值，不存在"调错访问器"的情况。

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde_json::{Value, json};

use crate::bedrock::TokenCounts;

/// 单次请求的事件序列：有限、有序、只能消费一次
pub type EventStream = Pin<Box<dyn Stream<Item = ResponseEvent> + Send>>;

pub enum ResponseModel {
    Streaming {
        /// 实际调用（计费）的模型 ID
        model_id: String,
        events: EventStream,
    },
    Buffered {
        model_id: String,
        body: Value,
        usage: Option<TokenCounts>,
    },
}

impl ResponseModel {
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Streaming { model_id, .. } | Self::Buffered { model_id, .. } => model_id,
        }
    }
}

impl std::fmt::Debug for ResponseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming { model_id, .. } => f
                .debug_struct("Streaming")
                .field("model_id", model_id)
                .finish_non_exhaustive(),
            Self::Buffered {
                model_id,
                body,
                usage,
            } => f
                .debug_struct("Buffered")
                .field("model_id", model_id)
                .field("body", body)
                .field("usage", usage)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    MessageStart,
    MessageDelta,
    MessageStop,
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    Ping,
    Error,
    /// 旧版 Text Completions 的 chunk
    Completion,
    Other(String),
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "message_start" => Self::MessageStart,
            "message_delta" => Self::MessageDelta,
            "message_stop" => Self::MessageStop,
            "content_block_start" => Self::ContentBlockStart,
            "content_block_delta" => Self::ContentBlockDelta,
            "content_block_stop" => Self::ContentBlockStop,
            "ping" => Self::Ping,
            "error" => Self::Error,
            "completion" => Self::Completion,
            other => Self::Other(other.to_string()),
        }
    }

    /// SSE `event:` 字段
    pub fn as_str(&self) -> &str {
        match self {
            Self::MessageStart => "message_start",
            Self::MessageDelta => "message_delta",
            Self::MessageStop => "message_stop",
            Self::ContentBlockStart => "content_block_start",
            Self::ContentBlockDelta => "content_block_delta",
            Self::ContentBlockStop => "content_block_stop",
            Self::Ping => "ping",
            Self::Error => "error",
            Self::Completion => "completion",
            Self::Other(kind) => kind,
        }
    }
}

/// 事件携带的用量（start 给输入，delta 给累计输出）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventUsage {
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

impl EventUsage {
    fn from_usage_object(usage: &Value) -> Option<Self> {
        let usage = usage.as_object()?;
        Some(Self {
            input_tokens: usage.get("input_tokens").and_then(Value::as_i64),
            output_tokens: usage.get("output_tokens").and_then(Value::as_i64),
        })
    }

    /// Bedrock 附加在最后一个事件上的 `amazon-bedrock-invocationMetrics`
    fn from_invocation_metrics(payload: &Value) -> Option<Self> {
        let metrics = payload.get("amazon-bedrock-invocationMetrics")?;
        Some(Self {
            input_tokens: metrics.get("inputTokenCount").and_then(Value::as_i64),
            output_tokens: metrics.get("outputTokenCount").and_then(Value::as_i64),
        })
    }
}

/// 转发给客户端的事件，payload 原样保留
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub kind: EventKind,
    pub usage: Option<EventUsage>,
    pub payload: Value,
}

impl ResponseEvent {
    pub fn from_payload(payload: Value) -> Self {
        let kind = EventKind::parse(payload.get("type").and_then(Value::as_str).unwrap_or(""));
        let usage = match kind {
            EventKind::MessageStart => payload
                .pointer("/message/usage")
                .and_then(EventUsage::from_usage_object),
            EventKind::MessageDelta => payload.get("usage").and_then(EventUsage::from_usage_object),
            _ => None,
        }
        .or_else(|| EventUsage::from_invocation_metrics(&payload));

        Self {
            kind,
            usage,
            payload,
        }
    }

    /// 流中途失败时发给客户端的终止事件
    pub fn error(error_type: &str, message: &str) -> Self {
        Self {
            kind: EventKind::Error,
            usage: None,
            payload: json!({
                "type": "error",
                "error": { "type": error_type, "message": message }
            }),
        }
    }

    /// 旧版 completion 的最后一个 chunk 带非空 `stop_reason`
    pub fn is_completion_stop(&self) -> bool {
        self.kind == EventKind::Completion
            && self.payload.get("stop_reason").is_some_and(|v| !v.is_null())
    }

    pub fn to_sse_frame(&self) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            self.kind.as_str(),
            self.payload
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_message_start_usage() {
        let event = ResponseEvent::from_payload(json!({
            "type": "message_start",
            "message": {"id": "msg_1", "usage": {"input_tokens": 25, "output_tokens": 1}}
        }));
        assert_eq!(event.kind, EventKind::MessageStart);
        assert_eq!(
            event.usage,
            Some(EventUsage {
                input_tokens: Some(25),
                output_tokens: Some(1)
            })
        );
    }

    #[test]
    fn test_message_delta_usage() {
        let event = ResponseEvent::from_payload(json!({
            "type": "message_delta",
            "delta": {"stop_reason": "end_turn"},
            "usage": {"output_tokens": 15}
        }));
        assert_eq!(event.usage.unwrap().output_tokens, Some(15));
        assert_eq!(event.usage.unwrap().input_tokens, None);
    }

    #[test]
    fn test_invocation_metrics_on_completion() {
        let event = ResponseEvent::from_payload(json!({
            "type": "completion",
            "completion": " world",
            "stop_reason": "stop_sequence",
            "amazon-bedrock-invocationMetrics": {"inputTokenCount": 9, "outputTokenCount": 4}
        }));
        assert!(event.is_completion_stop());
        assert_eq!(
            event.usage,
            Some(EventUsage {
                input_tokens: Some(9),
                output_tokens: Some(4)
            })
        );
    }

    #[test]
    fn test_sse_frame_format() {
        let payload = json!({"type": "content_block_stop", "index": 0});
        let event = ResponseEvent::from_payload(payload.clone());
        assert_eq!(
            event.to_sse_frame(),
            Bytes::from(format!("event: content_block_stop\ndata: {payload}\n\n"))
        );

        let unknown = ResponseEvent::from_payload(json!({"type": "future_event"}));
        assert_eq!(unknown.kind.as_str(), "future_event");
    }

    #[test]
    fn test_response_model_variants() {
        let buffered = ResponseModel::Buffered {
            model_id: "m".to_string(),
            body: json!({}),
            usage: None,
        };
        assert!(!buffered.is_streaming());
        assert_eq!(buffered.model_id(), "m");

        let streaming = ResponseModel::Streaming {
            model_id: "m".to_string(),
            events: Box::pin(stream::empty()),
        };
        assert!(streaming.is_streaming());
    }
}
