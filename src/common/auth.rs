//! 认证相关的公共工具

use axum::{body::Body, http::Request};
use http::HeaderMap;
use subtle::ConstantTimeEq;

/// 从请求头提取 API Key
///
/// 优先 `x-api-key`，其次 `Authorization: Bearer <key>`
pub fn extract_api_key(request: &Request<Body>) -> Option<String> {
    api_key_from_headers(request.headers())
}

pub fn api_key_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// 常量时间字符串比较（防止时序攻击）
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
