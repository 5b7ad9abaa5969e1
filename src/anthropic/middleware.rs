//! Anthropic API middleware

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};

use crate::common::auth;
use crate::keycache::KeyCache;
use crate::metering::UsageMeter;

use super::adapter::ProtocolAdapter;
use super::types::ErrorResponse;

/// 未能解析 Key 名称时写入账本的名称
pub const DEFAULT_KEY_NAME: &str = "default";

#[derive(Clone)]
pub struct AppState {
    pub key_cache: Arc<KeyCache>,
    pub adapter: Arc<ProtocolAdapter>,
    pub meter: Arc<UsageMeter>,
}

impl AppState {
    pub fn new(key_cache: Arc<KeyCache>, adapter: ProtocolAdapter, meter: Arc<UsageMeter>) -> Self {
        Self {
            key_cache,
            adapter: Arc::new(adapter),
            meter,
        }
    }
}

/// 认证通过的调用方，写入 request extensions
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub name: String,
    pub value: String,
}

impl AuthenticatedKey {
    /// 名称为空时回落到 `"default"`
    pub fn ledger_name(&self) -> &str {
        if self.name.trim().is_empty() {
            DEFAULT_KEY_NAME
        } else {
            &self.name
        }
    }
}

/// 错误一律以 200 + 错误信封返回，与上游协议的客户端行为保持一致
pub fn error_response(error: ErrorResponse) -> Response {
    (StatusCode::OK, Json(error)).into_response()
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(secret) = auth::extract_api_key(&request) else {
        return error_response(ErrorResponse::authentication_error());
    };

    match state.key_cache.validate(&secret) {
        Ok(Some(record)) => {
            request.extensions_mut().insert(AuthenticatedKey {
                name: record.name,
                value: record.value,
            });
            next.run(request).await
        }
        Ok(None) => {
            tracing::debug!("API Key 无效或已禁用");
            error_response(ErrorResponse::authentication_error())
        }
        Err(e) => {
            tracing::error!("API Key 校验失败: {}", e);
            error_response(ErrorResponse::api_error("API key store unavailable"))
        }
    }
}

pub fn cors_layer() -> tower_http::cors::CorsLayer {
    use tower_http::cors::{Any, CorsLayer};

    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
