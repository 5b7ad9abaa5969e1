//! Admin API：API Key 管理与用量查询
//!
//! 仅在配置了 `adminUsername` / `adminPassword` 时启用。

mod handlers;
mod middleware;
mod router;
mod service;
pub mod types;

pub use middleware::AdminState;
pub use router::create_admin_router;
pub use service::AdminService;
