//! Anthropic API 请求/错误类型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 错误信封：`{"type":"error","error":{"type":...,"message":...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ErrorDetail {
                error_type: error_type.into(),
                message: message.into(),
            },
        }
    }

    pub fn authentication_error() -> Self {
        Self::new("authentication_error", "Invalid API key")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new("invalid_request_error", message)
    }

    pub fn api_error(message: impl Into<String>) -> Self {
        Self::new("api_error", message)
    }

    pub fn not_found() -> Self {
        Self::new("not_found_error", "Not found")
    }
}

/// `POST /v1/messages`
///
/// 只解析网关需要的字段，其余字段原样透传给 Bedrock。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Value>,
    pub max_tokens: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `POST /v1/complete`（旧版 Text Completions）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextCompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens_to_sample: u32,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anthropic_version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_envelope_shape() {
        let value = serde_json::to_value(ErrorResponse::authentication_error()).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "error": {"type": "authentication_error", "message": "Invalid API key"}})
        );
    }

    #[test]
    fn test_messages_request_keeps_unknown_fields() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-haiku",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
            "temperature": 0.2,
            "system": "be brief"
        }))
        .unwrap();
        assert!(!req.stream);
        assert!(req.anthropic_version.is_none());
        assert_eq!(req.extra.get("temperature"), Some(&json!(0.2)));

        let round = serde_json::to_value(&req).unwrap();
        assert_eq!(round["system"], "be brief");
        assert!(round.get("anthropic_version").is_none());
    }

    #[test]
    fn test_completion_requires_prompt() {
        let err = serde_json::from_value::<TextCompletionRequest>(json!({
            "model": "claude-2.1",
            "max_tokens_to_sample": 10
        }));
        assert!(err.is_err());
    }
}
