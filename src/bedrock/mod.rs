//! AWS Bedrock Runtime 后端
//!
//! 网关只调用 [`Backend::invoke`]：给定模型 ID、请求体和是否流式，
//! 返回整包响应或解码后的事件流。

pub mod client;
pub mod eventstream;
pub mod models;
pub mod sigv4;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;

pub use client::BedrockClient;
pub use models::ModelResolver;

use eventstream::EventStreamError;
use sigv4::SigningError;

/// 一次后端调用
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    /// 已解析的 Bedrock 模型 ID
    pub model_id: String,
    pub body: Value,
    pub stream: bool,
}

/// 非流式响应头里带的 token 数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// 流式响应：每项是一个 Anthropic 事件 JSON，出错后流结束
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value, BackendError>> + Send>>;

pub enum BackendReply {
    Buffered {
        body: Value,
        usage: Option<TokenCounts>,
    },
    Streaming(ChunkStream),
}

impl std::fmt::Debug for BackendReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered { body, usage } => f
                .debug_struct("Buffered")
                .field("body", body)
                .field("usage", usage)
                .finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// 只调用一次，不重试
    async fn invoke(&self, request: InvokeRequest) -> Result<BackendReply, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Bedrock 拒绝请求 ({status}): {message}")]
    Rejected {
        status: u16,
        error_type: Option<String>,
        message: String,
    },

    #[error("Bedrock 流异常 {exception_type}: {message}")]
    StreamException {
        exception_type: String,
        message: String,
    },

    #[error("Bedrock 请求失败: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    EventStream(#[from] EventStreamError),

    #[error("JSON 编解码失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid Bedrock response: {0}")]
    InvalidResponse(String),

    #[error("等待 Bedrock 响应超时 ({0:?})")]
    Timeout(std::time::Duration),
}

impl BackendError {
    /// 对应 Anthropic 错误信封里的 `error.type`
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Rejected {
                status, error_type, ..
            } => error_type
                .as_deref()
                .and_then(exception_error_type)
                .unwrap_or_else(|| status_error_type(*status)),
            Self::StreamException { exception_type, .. } => {
                exception_error_type(exception_type).unwrap_or("api_error")
            }
            _ => "api_error",
        }
    }

    /// 返回给客户端的错误描述
    pub fn client_message(&self) -> String {
        match self {
            Self::Rejected { message, .. } | Self::StreamException { message, .. }
                if !message.is_empty() =>
            {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

fn status_error_type(status: u16) -> &'static str {
    match status {
        400 | 422 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}

/// `x-amzn-ErrorType` / `:exception-type` → 错误类型
fn exception_error_type(exception: &str) -> Option<&'static str> {
    let name = exception.split(':').next().unwrap_or(exception);
    let kind = match name.to_ascii_lowercase().as_str() {
        "validationexception" => "invalid_request_error",
        "accessdeniedexception" => "permission_error",
        "unrecognizedclientexception" | "invalidsignatureexception" => "authentication_error",
        "resourcenotfoundexception" => "not_found_error",
        "throttlingexception" | "servicequotaexceededexception" => "rate_limit_error",
        "serviceunavailableexception" | "modelnotreadyexception" => "overloaded_error",
        "internalserverexception"
        | "modelstreamerrorexception"
        | "modeltimeoutexception"
        | "modelerrorexception" => "api_error",
        _ => return None,
    };
    Some(kind)
}
