use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use super::{
    handlers::{
        create_api_key, delete_api_key, list_api_keys, list_usage, login, set_api_key_disabled,
        usage_stats,
    },
    middleware::{AdminState, admin_auth_middleware},
};

/// `POST /login/admin` 无需认证，`/admin/*` 需要会话 token
pub fn create_admin_router(state: AdminState) -> Router {
    let protected = Router::new()
        .route("/apikey/create", post(create_api_key))
        .route("/apikey/list", get(list_api_keys))
        .route("/apikey/{id}/delete", delete(delete_api_key))
        .route("/apikey/{id}/disabled", post(set_api_key_disabled))
        .route("/usage/list", get(list_usage))
        .route("/usage/stats", get(usage_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ));

    Router::new()
        .route("/login/admin", post(login))
        .nest("/admin", protected)
        .with_state(state)
}
