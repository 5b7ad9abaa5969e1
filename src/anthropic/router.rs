//! Anthropic API router

use std::path::Path;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    response::Redirect,
    routing::{get, post},
};
use tower_http::services::ServeDir;

use super::{
    handlers::{method_not_allowed, not_found, post_complete, post_messages},
    middleware::{AppState, auth_middleware, cors_layer},
};

const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/complete", post(post_complete).fallback(method_not_allowed))
        .route("/messages", post(post_messages).fallback(method_not_allowed))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .nest("/v1", v1_routes)
        .layer(cors_layer())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// 未匹配的路由：配置了静态目录时交给静态文件，否则 404 错误信封
pub fn with_fallback(app: Router, web_root: Option<&Path>) -> Router {
    match web_root {
        Some(root) => app
            .route("/", get(|| async { Redirect::temporary("/swagger/") }))
            .fallback_service(ServeDir::new(root).fallback(get(not_found))),
        None => app.fallback(not_found),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_web_root_serves_files_and_redirects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("swagger")).unwrap();
        std::fs::write(dir.path().join("swagger").join("index.html"), "<html>docs</html>").unwrap();

        let app = with_fallback(Router::new(), Some(dir.path()));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/swagger/");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/swagger/index.html")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/missing.js").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
