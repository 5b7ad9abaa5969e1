//! Bedrock Runtime HTTP 客户端

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::eventstream::{BedrockFrame, EventStreamDecoder, interpret};
use super::sigv4::{SigV4Signer, SigV4Timestamp};
use super::{Backend, BackendError, BackendReply, InvokeRequest, TokenCounts};
use crate::model::config::BedrockConfig;

const SERVICE: &str = "bedrock";
const EVENT_STREAM_ACCEPT: &str = "application/vnd.amazon.eventstream";

pub struct BedrockClient {
    http: reqwest::Client,
    endpoint: String,
    signer: SigV4Signer,
    timeout: Duration,
}

impl BedrockClient {
    pub fn new(
        signer: SigV4Signer,
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        // 整体超时只加在非流式请求上；流式响应体只限制两次读取之间的间隔
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            signer,
            timeout,
        })
    }

    pub fn from_config(config: &BedrockConfig) -> Result<Self, BackendError> {
        let signer = SigV4Signer::new(
            config.access_key_id.clone().unwrap_or_default(),
            config.secret_access_key.clone().unwrap_or_default(),
            config.session_token.clone(),
            config.region.clone(),
            SERVICE,
        )?;
        Self::new(
            signer,
            config.effective_endpoint(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// 模型 ID 作为单个路径段编码（`:` → `%3A`）
    fn invoke_url(&self, model_id: &str, stream: bool) -> String {
        let action = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        format!(
            "{}/model/{}/{}",
            self.endpoint,
            urlencoding::encode(model_id),
            action
        )
    }
}

#[async_trait]
impl Backend for BedrockClient {
    async fn invoke(&self, request: InvokeRequest) -> Result<BackendReply, BackendError> {
        let url = self.invoke_url(&request.model_id, request.stream);
        let payload = serde_json::to_vec(&request.body)?;
        let accept = if request.stream {
            EVENT_STREAM_ACCEPT
        } else {
            "application/json"
        };
        let headers = BTreeMap::from([
            ("accept".to_string(), accept.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]);

        let signed = self
            .signer
            .sign("POST", &url, &headers, &payload, &SigV4Timestamp::now())?;

        tracing::debug!(model = %request.model_id, stream = request.stream, "调用 Bedrock");
        let mut builder = self.http.post(&url).body(payload);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        let builder = signed.apply(builder);
        let response = if request.stream {
            // 只等到响应头，之后交给 read_timeout
            tokio::time::timeout(self.timeout, builder.send())
                .await
                .map_err(|_| BackendError::Timeout(self.timeout))??
        } else {
            builder.timeout(self.timeout).send().await?
        };

        let status = response.status();
        if !status.is_success() {
            return Err(rejection(response).await);
        }

        if request.stream {
            return Ok(BackendReply::Streaming(Box::pin(chunk_stream(response))));
        }

        let usage = token_counts(response.headers());
        let body: Value = response.json().await?;
        Ok(BackendReply::Buffered { body, usage })
    }
}

async fn rejection(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    let error_type = response
        .headers()
        .get("x-amzn-ErrorType")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(':').next().unwrap_or(v).to_string());
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(text);

    tracing::warn!(status, error_type = ?error_type, "Bedrock 拒绝请求: {}", message);
    BackendError::Rejected {
        status,
        error_type,
        message,
    }
}

fn token_counts(headers: &HeaderMap) -> Option<TokenCounts> {
    let read = |name: &str| -> Option<i64> { headers.get(name)?.to_str().ok()?.trim().parse().ok() };
    Some(TokenCounts {
        input_tokens: read("x-amzn-bedrock-input-token-count")?,
        output_tokens: read("x-amzn-bedrock-output-token-count")?,
    })
}

struct ChunkState<S> {
    bytes: S,
    decoder: EventStreamDecoder,
    pending: VecDeque<Result<Value, BackendError>>,
    finished: bool,
}

/// 把 event-stream 响应体转换为 Anthropic 事件流
///
/// 异常帧、解码错误或连接中断都会产出一个 `Err` 并结束流。
fn chunk_stream(response: reqwest::Response) -> impl Stream<Item = Result<Value, BackendError>> {
    let state = ChunkState {
        bytes: response.bytes_stream(),
        decoder: EventStreamDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.decoder.push(&chunk);
                    drain_decoder(&mut state.decoder, &mut state.pending, &mut state.finished);
                }
                Some(Err(e)) => {
                    state.pending.push_back(Err(BackendError::Transport(e)));
                    state.finished = true;
                }
                None => {
                    if state.decoder.remaining() > 0 {
                        state.pending.push_back(Err(BackendError::InvalidResponse(format!(
                            "event stream truncated ({} bytes left)",
                            state.decoder.remaining()
                        ))));
                    }
                    state.finished = true;
                }
            }
        }
    })
}

fn drain_decoder(
    decoder: &mut EventStreamDecoder,
    pending: &mut VecDeque<Result<Value, BackendError>>,
    finished: &mut bool,
) {
    while !*finished {
        let Some(message) = decoder.next_message() else {
            return;
        };
        let frame = message
            .map_err(BackendError::from)
            .and_then(|m| interpret(&m).map_err(BackendError::from));
        match frame {
            Ok(Some(BedrockFrame::Chunk(event))) => pending.push_back(Ok(event)),
            Ok(None) => {}
            Ok(Some(BedrockFrame::Exception {
                exception_type,
                message,
            })) => {
                pending.push_back(Err(BackendError::StreamException {
                    exception_type,
                    message,
                }));
                *finished = true;
            }
            Err(e) => {
                pending.push_back(Err(e));
                *finished = true;
            }
        }
    }
}
