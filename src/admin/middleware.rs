//! Admin middleware and state

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::service::AdminService;
use super::types::AdminErrorResponse;
use crate::common::auth;

const SESSION_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token: String,
    pub username: String,
    pub expires_at: DateTime<Utc>,
}

/// 登录会话，仅保存在内存中，重启后需重新登录
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, AdminSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(&self, username: &str) -> AdminSession {
        let token = format!("adm_{}", Uuid::new_v4().simple());
        let session = AdminSession {
            token: token.clone(),
            username: username.to_string(),
            expires_at: Utc::now() + Duration::hours(SESSION_TTL_HOURS),
        };
        self.sessions.lock().insert(token, session.clone());
        session
    }

    pub fn validate(&self, token: &str) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, s| s.expires_at > now);
        sessions.contains_key(token)
    }

    #[cfg(test)]
    fn expire_all(&self) {
        let past = Utc::now() - Duration::seconds(1);
        for session in self.sessions.lock().values_mut() {
            session.expires_at = past;
        }
    }
}

#[derive(Clone)]
pub struct AdminState {
    pub admin_username: String,
    pub admin_password: String,
    pub sessions: Arc<SessionManager>,
    pub service: Arc<AdminService>,
}

impl AdminState {
    pub fn new(
        admin_username: impl Into<String>,
        admin_password: impl Into<String>,
        service: AdminService,
    ) -> Self {
        Self {
            admin_username: admin_username.into(),
            admin_password: admin_password.into(),
            sessions: Arc::new(SessionManager::new()),
            service: Arc::new(service),
        }
    }

    pub fn verify_login(&self, username: &str, password: &str) -> bool {
        // 两项都比较，避免短路泄露用户名是否正确
        let user_ok = auth::constant_time_eq(username, &self.admin_username);
        let pass_ok = auth::constant_time_eq(password, &self.admin_password);
        user_ok & pass_ok
    }
}

pub async fn admin_auth_middleware(
    State(state): State<AdminState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    match auth::extract_api_key(&request) {
        Some(token) if state.sessions.validate(&token) => next.run(request).await,
        _ => {
            let error = AdminErrorResponse::authentication_error();
            (StatusCode::UNAUTHORIZED, Json(error)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_roundtrip_and_expiry() {
        let sessions = SessionManager::new();
        let session = sessions.create_session("admin");
        assert!(session.token.starts_with("adm_"));
        assert!(sessions.validate(&session.token));
        assert!(!sessions.validate("adm_unknown"));

        sessions.expire_all();
        assert!(!sessions.validate(&session.token));
    }
}
