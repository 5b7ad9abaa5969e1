use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::{
    middleware::AdminState,
    service::AdminServiceError,
    types::{
        AdminErrorResponse, CreateApiKeyRequest, LoginRequest, LoginResponse,
        SetApiKeyDisabledRequest, SuccessResponse, UsageListParams,
    },
};

fn reply<T: serde::Serialize>(result: Result<T, AdminServiceError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            if e.status_code().is_server_error() {
                tracing::error!("Admin 请求失败: {}", e);
            }
            (e.status_code(), Json(e.into_response())).into_response()
        }
    }
}

pub async fn login(
    State(state): State<AdminState>,
    Json(payload): Json<LoginRequest>,
) -> impl IntoResponse {
    if !state.verify_login(&payload.username, &payload.password) {
        tracing::warn!(username = %payload.username, "管理员登录失败");
        return (
            StatusCode::UNAUTHORIZED,
            Json(AdminErrorResponse::authentication_error()),
        )
            .into_response();
    }

    let session = state.sessions.create_session(&payload.username);
    Json(LoginResponse {
        token: session.token,
        expires_at: session.expires_at.to_rfc3339(),
    })
    .into_response()
}

pub async fn create_api_key(
    State(state): State<AdminState>,
    Json(payload): Json<CreateApiKeyRequest>,
) -> impl IntoResponse {
    reply(state.service.create_api_key(&payload.name))
}

pub async fn list_api_keys(State(state): State<AdminState>) -> impl IntoResponse {
    reply(state.service.list_api_keys())
}

pub async fn set_api_key_disabled(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(payload): Json<SetApiKeyDisabledRequest>,
) -> impl IntoResponse {
    reply(
        state
            .service
            .set_api_key_disabled(id, payload.disabled)
            .map(|_| SuccessResponse::new("更新成功")),
    )
}

pub async fn delete_api_key(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    reply(
        state
            .service
            .delete_api_key(id)
            .map(|_| SuccessResponse::new("删除成功")),
    )
}

pub async fn list_usage(
    State(state): State<AdminState>,
    Query(params): Query<UsageListParams>,
) -> impl IntoResponse {
    reply(state.service.list_usage(params))
}

pub async fn usage_stats(State(state): State<AdminState>) -> impl IntoResponse {
    reply(state.service.usage_stats())
}
