//! Anthropic 请求 → Bedrock 调用

use std::sync::Arc;

use axum::http::HeaderMap;
use futures::{StreamExt, future};
use serde::Serialize;
use serde_json::{Map, Value};

use super::response::{ResponseEvent, ResponseModel};
use super::types::{MessagesRequest, TextCompletionRequest};
use crate::bedrock::{Backend, BackendError, BackendReply, InvokeRequest, ModelResolver, TokenCounts};

pub const DEFAULT_BEDROCK_VERSION: &str = "bedrock-2023-05-31";

pub struct ProtocolAdapter {
    backend: Arc<dyn Backend>,
    models: ModelResolver,
    bedrock_version: String,
}

impl ProtocolAdapter {
    pub fn new(backend: Arc<dyn Backend>, models: ModelResolver) -> Self {
        Self {
            backend,
            models,
            bedrock_version: DEFAULT_BEDROCK_VERSION.to_string(),
        }
    }

    pub fn with_bedrock_version(mut self, version: impl Into<String>) -> Self {
        self.bedrock_version = version.into();
        self
    }

    /// `/v1/complete`
    pub async fn complete_text(
        &self,
        mut req: TextCompletionRequest,
        headers: &HeaderMap,
    ) -> Result<ResponseModel, BackendError> {
        backfill_version(&mut req.anthropic_version, headers);
        let (model, stream) = (req.model.clone(), req.stream);
        self.dispatch(&model, stream, &req, headers).await
    }

    /// `/v1/messages`
    pub async fn message_completion(
        &self,
        mut req: MessagesRequest,
        headers: &HeaderMap,
    ) -> Result<ResponseModel, BackendError> {
        backfill_version(&mut req.anthropic_version, headers);
        let (model, stream) = (req.model.clone(), req.stream);
        self.dispatch(&model, stream, &req, headers).await
    }

    async fn dispatch<T: Serialize>(
        &self,
        model: &str,
        stream: bool,
        req: &T,
        headers: &HeaderMap,
    ) -> Result<ResponseModel, BackendError> {
        let model_id = self.models.resolve(model);
        let body = self.bedrock_body(req, headers)?;

        tracing::info!(model = %model, model_id = %model_id, stream, "转发请求到 Bedrock");
        let reply = self
            .backend
            .invoke(InvokeRequest {
                model_id: model_id.clone(),
                body,
                stream,
            })
            .await?;

        Ok(match reply {
            BackendReply::Buffered { body, usage } => {
                let usage = body_usage(&body).or(usage);
                ResponseModel::Buffered {
                    model_id,
                    body,
                    usage,
                }
            }
            BackendReply::Streaming(chunks) => {
                let events = chunks.scan(false, |failed, item| {
                    if *failed {
                        return future::ready(None);
                    }
                    let event = match item {
                        Ok(payload) => ResponseEvent::from_payload(payload),
                        Err(e) => {
                            tracing::error!("Bedrock 事件流中断: {}", e);
                            *failed = true;
                            ResponseEvent::error(e.error_type(), &e.client_message())
                        }
                    };
                    future::ready(Some(event))
                });
                ResponseModel::Streaming {
                    model_id,
                    events: Box::pin(events),
                }
            }
        })
    }

    /// 去掉 `model` / `stream`，修正 `anthropic_version`，带上 `anthropic_beta`
    fn bedrock_body<T: Serialize>(&self, req: &T, headers: &HeaderMap) -> Result<Value, BackendError> {
        let mut body = match serde_json::to_value(req)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        body.remove("model");
        body.remove("stream");

        let version = body
            .get("anthropic_version")
            .and_then(Value::as_str)
            .filter(|v| v.starts_with("bedrock-"))
            .map(str::to_string)
            .unwrap_or_else(|| self.bedrock_version.clone());
        body.insert("anthropic_version".to_string(), Value::String(version));

        if !body.contains_key("anthropic_beta") {
            let betas = beta_header(headers);
            if !betas.is_empty() {
                body.insert(
                    "anthropic_beta".to_string(),
                    Value::Array(betas.into_iter().map(Value::String).collect()),
                );
            }
        }
        Ok(Value::Object(body))
    }
}

/// 请求体未带版本时使用 `anthropic-version` 请求头
fn backfill_version(version: &mut Option<String>, headers: &HeaderMap) {
    if version.as_deref().is_some_and(|v| !v.trim().is_empty()) {
        return;
    }
    *version = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
}

fn beta_header(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("anthropic-beta")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// Messages API 的非流式响应体自带 usage
fn body_usage(body: &Value) -> Option<TokenCounts> {
    let usage = body.get("usage")?;
    Some(TokenCounts {
        input_tokens: usage.get("input_tokens")?.as_i64()?,
        output_tokens: usage.get("output_tokens")?.as_i64()?,
    })
}
