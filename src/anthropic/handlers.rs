//! Anthropic API Handler 函数

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;

use super::middleware::{AppState, AuthenticatedKey, DEFAULT_KEY_NAME, error_response};
use super::response::ResponseModel;
use super::tap::{self, MeterContext};
use super::types::{ErrorResponse, MessagesRequest, TextCompletionRequest};

/// POST /v1/messages
pub async fn post_messages(
    State(state): State<AppState>,
    auth: Option<Extension<AuthenticatedKey>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: MessagesRequest = match parse_json_body(&headers, &body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    tracing::debug!(model = %req.model, stream = req.stream, "收到 Messages 请求");

    match state.adapter.message_completion(req, &headers).await {
        Ok(response) => respond(&state, caller(auth), response),
        Err(e) => {
            tracing::warn!("Messages 请求失败: {}", e);
            error_response(ErrorResponse::new(e.error_type(), e.client_message()))
        }
    }
}

/// POST /v1/complete
pub async fn post_complete(
    State(state): State<AppState>,
    auth: Option<Extension<AuthenticatedKey>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: TextCompletionRequest = match parse_json_body(&headers, &body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    tracing::debug!(model = %req.model, stream = req.stream, "收到 Text Completions 请求");

    match state.adapter.complete_text(req, &headers).await {
        Ok(response) => respond(&state, caller(auth), response),
        Err(e) => {
            tracing::warn!("Text Completions 请求失败: {}", e);
            error_response(ErrorResponse::new(e.error_type(), e.client_message()))
        }
    }
}

/// 路由存在但方法不对
pub async fn method_not_allowed() -> Response {
    error_response(ErrorResponse::invalid_request("method not allowed"))
}

/// 未匹配任何路由
pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::not_found())).into_response()
}

fn caller(auth: Option<Extension<AuthenticatedKey>>) -> AuthenticatedKey {
    match auth {
        Some(Extension(key)) => key,
        None => AuthenticatedKey {
            name: DEFAULT_KEY_NAME.to_string(),
            value: String::new(),
        },
    }
}

/// Content-Type 与 JSON 校验，失败时不会调用后端
fn parse_json_body<T: DeserializeOwned>(headers: &HeaderMap, body: &Bytes) -> Result<T, Response> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().to_ascii_lowercase().starts_with("application/json"));
    if !is_json {
        return Err(error_response(ErrorResponse::invalid_request(
            "content-type must be application/json",
        )));
    }

    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!("请求体解析失败: {}", e);
        error_response(ErrorResponse::invalid_request(format!(
            "invalid request body: {e}"
        )))
    })
}

fn respond(state: &AppState, key: AuthenticatedKey, response: ResponseModel) -> Response {
    match response {
        ResponseModel::Streaming { model_id, events } => {
            let rx = tap::spawn_tap(
                events,
                MeterContext {
                    meter: state.meter.clone(),
                    api_key_name: key.ledger_name().to_string(),
                    api_key_value: key.value,
                    model_id,
                },
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::CONNECTION, "keep-alive")
                .body(Body::from_stream(tap::sse_body(rx)))
                .unwrap_or_else(|e| {
                    tracing::error!("构建 SSE 响应失败: {}", e);
                    error_response(ErrorResponse::api_error("failed to build response"))
                })
        }
        ResponseModel::Buffered {
            model_id,
            body,
            usage,
        } => {
            match usage {
                Some(usage) => state.meter.settle(
                    key.ledger_name(),
                    &key.value,
                    &model_id,
                    usage.input_tokens,
                    usage.output_tokens,
                ),
                None => tracing::warn!(model = %model_id, "响应中没有用量信息，本次请求不记录用量"),
            }
            (StatusCode::OK, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::Router;
    use axum::http::Request;
    use futures::stream;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::anthropic::adapter::ProtocolAdapter;
    use crate::anthropic::router::{create_router, with_fallback};
    use crate::apikeys::ApiKeyManager;
    use crate::bedrock::{
        Backend, BackendError, BackendReply, ChunkStream, InvokeRequest, ModelResolver,
        TokenCounts,
    };
    use crate::db;
    use crate::keycache::KeyCache;
    use crate::metering::{ModelPricing, PricingTable, UsageMeter};
    use crate::usage::{UsageQuery, UsageStore};

    use super::*;

    const HAIKU: &str = "us.anthropic.claude-3-haiku-20240307-v1:0";

    enum Script {
        Buffered(Value, Option<TokenCounts>),
        Streaming(Vec<Value>),
        Fail(u16),
    }

    struct FakeBackend {
        calls: AtomicUsize,
        script: Mutex<Script>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn invoke(&self, _request: InvokeRequest) -> Result<BackendReply, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &*self.script.lock() {
                Script::Buffered(body, usage) => Ok(BackendReply::Buffered {
                    body: body.clone(),
                    usage: *usage,
                }),
                Script::Streaming(events) => {
                    let chunks: ChunkStream =
                        Box::pin(stream::iter(events.clone().into_iter().map(Ok)));
                    Ok(BackendReply::Streaming(chunks))
                }
                Script::Fail(status) => Err(BackendError::Rejected {
                    status: *status,
                    error_type: None,
                    message: "backend said no".to_string(),
                }),
            }
        }
    }

    struct Harness {
        app: Router,
        backend: Arc<FakeBackend>,
        keys: Arc<ApiKeyManager>,
        usage: Arc<UsageStore>,
        secret: String,
    }

    fn harness(script: Script) -> Harness {
        let conn = db::open_in_memory().unwrap();
        let keys = Arc::new(ApiKeyManager::new(conn.clone()));
        let usage = Arc::new(UsageStore::new(conn));
        let secret = keys.create_key("alice").unwrap().value;

        let backend = Arc::new(FakeBackend {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script),
        });
        let pricing = PricingTable::from_entries([(HAIKU, ModelPricing::new(1.0, 2.0))]);
        let meter = Arc::new(UsageMeter::new(pricing, usage.clone()));
        let cache = Arc::new(KeyCache::new(keys.clone(), None));
        let adapter = ProtocolAdapter::new(backend.clone(), ModelResolver::default());

        let app = with_fallback(create_router(AppState::new(cache, adapter, meter)), None);
        Harness {
            app,
            backend,
            keys,
            usage,
            secret,
        }
    }

    fn messages_body(stream: bool) -> String {
        json!({
            "model": "claude-3-haiku",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 16,
            "stream": stream
        })
        .to_string()
    }

    fn post(path: &str, key: Option<&str>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    fn error_type(body: &Bytes) -> String {
        let value: Value = serde_json::from_slice(body).unwrap();
        assert_eq!(value["type"], "error");
        value["error"]["type"].as_str().unwrap().to_string()
    }

    fn usage_rows(usage: &UsageStore) -> Vec<crate::usage::UsageItem> {
        usage.list(&UsageQuery::default()).unwrap().items
    }

    #[tokio::test]
    async fn test_missing_key_rejected_without_backend_call() {
        let h = harness(Script::Buffered(json!({}), None));
        let (status, _, body) = send(&h.app, post("/v1/messages", None, messages_body(false))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(error_type(&body), "authentication_error");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_key_rejected_without_backend_call() {
        let h = harness(Script::Buffered(json!({}), None));
        let record = h.keys.list().unwrap().remove(0);
        h.keys.set_enabled(record.id, false).unwrap();

        let (status, _, body) = send(
            &h.app,
            post("/v1/messages", Some(&h.secret), messages_body(false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(error_type(&body), "authentication_error");
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bearer_token_accepted() {
        let h = harness(Script::Buffered(json!({"type": "message"}), None));
        let request = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", h.secret))
            .body(Body::from(messages_body(false)))
            .unwrap();
        let (_, _, body) = send(&h.app, request).await;
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "message");
    }

    #[tokio::test]
    async fn test_validation_errors_skip_backend() {
        let h = harness(Script::Buffered(json!({}), None));

        let wrong_type = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "text/plain")
            .header("x-api-key", &h.secret)
            .body(Body::from(messages_body(false)))
            .unwrap();
        let (status, _, body) = send(&h.app, wrong_type).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(error_type(&body), "invalid_request_error");

        let (_, _, body) = send(
            &h.app,
            post("/v1/messages", Some(&h.secret), "{not json".to_string()),
        )
        .await;
        assert_eq!(error_type(&body), "invalid_request_error");

        let wrong_method = Request::builder()
            .method("GET")
            .uri("/v1/messages")
            .header("x-api-key", &h.secret)
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&h.app, wrong_method).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(error_type(&body), "invalid_request_error");

        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_buffered_response_recorded_once() {
        let reply = json!({
            "id": "msg_1",
            "type": "message",
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 10, "output_tokens": 8}
        });
        let h = harness(Script::Buffered(reply.clone(), None));

        let (status, headers, body) = send(
            &h.app,
            post("/v1/messages", Some(&h.secret), messages_body(false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(
            headers[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("application/json")
        );
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), reply);

        let rows = usage_rows(&h.usage);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].apikey_name, "alice");
        assert_eq!(rows[0].model_name, HAIKU);
        assert_eq!(rows[0].quota, 26);
    }

    #[tokio::test]
    async fn test_streaming_forwards_events_and_records_once() {
        let events = vec![
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 10, "output_tokens": 1}}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 8}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_stop"}),
        ];
        let h = harness(Script::Streaming(events.clone()));

        let (status, headers, body) = send(
            &h.app,
            post("/v1/messages", Some(&h.secret), messages_body(true)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");

        let text = String::from_utf8(body.to_vec()).unwrap();
        let expected: String = events
            .iter()
            .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
            .collect();
        assert_eq!(text, expected);

        let rows = usage_rows(&h.usage);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].input_tokens, 10);
        assert_eq!(rows[0].output_tokens, 8);
    }

    #[tokio::test]
    async fn test_completion_endpoint_meters_header_usage() {
        let h = harness(Script::Buffered(
            json!({"type": "completion", "completion": "hi", "stop_reason": "stop_sequence"}),
            Some(TokenCounts {
                input_tokens: 4,
                output_tokens: 3,
            }),
        ));
        let body = json!({
            "model": HAIKU,
            "prompt": "\n\nHuman: hi\n\nAssistant:",
            "max_tokens_to_sample": 10
        })
        .to_string();

        let (_, _, resp) = send(&h.app, post("/v1/complete", Some(&h.secret), body)).await;
        let value: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(value["completion"], "hi");

        let rows = usage_rows(&h.usage);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quota, 10);
    }

    #[tokio::test]
    async fn test_backend_rejection_becomes_envelope() {
        let h = harness(Script::Fail(429));
        let (status, _, body) = send(
            &h.app,
            post("/v1/messages", Some(&h.secret), messages_body(false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(error_type(&body), "rate_limit_error");
        assert!(usage_rows(&h.usage).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404_envelope() {
        let h = harness(Script::Buffered(json!({}), None));
        let request = Request::builder()
            .uri("/v2/nothing")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error_type(&body), "not_found_error");
    }

    #[test]
    fn test_missing_auth_extension_falls_back_to_default_name() {
        let key = caller(None);
        assert_eq!(key.ledger_name(), "default");
    }
}
