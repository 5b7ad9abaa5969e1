//! Anthropic 兼容网关
//!
//! - `POST /v1/messages`
//! - `POST /v1/complete`
//!
//! 请求经 API Key 认证后由 [`adapter::ProtocolAdapter`] 转发到 Bedrock，
//! 流式响应经 [`tap`] 转发并统计用量。

pub mod adapter;
mod handlers;
pub mod middleware;
pub mod response;
mod router;
pub mod tap;
pub mod types;

pub use adapter::ProtocolAdapter;
pub use middleware::AppState;
pub use router::{create_router, with_fallback};
