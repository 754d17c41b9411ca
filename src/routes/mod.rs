pub mod add;
pub mod current;
pub mod health;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(add::router())
        .merge(current::router())
        .merge(crate::openapi::router())
        .with_state(state)
}

#[cfg(test)]
mod auth_gaps_tests {
    use super::*;
    use crate::config::AuthType;
    use crate::test_support::{test_config_without_maps, test_state_with};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::OnceLock;
    use tower::ServiceExt;

    static STATE: OnceLock<AppState> = OnceLock::new();

    // Remote identity mode with an unreachable provider: only anonymous paths may succeed.
    fn state() -> AppState {
        STATE
            .get_or_init(|| {
                let mut config = test_config_without_maps();
                config.auth_type = AuthType::Soauth;
                test_state_with(config)
            })
            .clone()
    }

    async fn status_for(method: &str, uri: &str) -> StatusCode {
        router(state())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn add_routes_require_bearer_auth() {
        assert_eq!(status_for("GET", "/add").await, StatusCode::UNAUTHORIZED);
        assert_eq!(status_for("GET", "/add/create").await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for("POST", "/add/evaluate").await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn current_routes_require_bearer_auth() {
        assert_eq!(status_for("GET", "/current").await, StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for("DELETE", "/current/groups/1").await,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for("DELETE", "/current/layers/1").await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn malformed_authorization_header_is_unauthorized() {
        let resp = router(state())
            .oneshot(
                Request::builder()
                    .uri("/current")
                    .header("authorization", "Basic abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_and_openapi_are_public() {
        assert_eq!(status_for("GET", "/healthz").await, StatusCode::OK);
        assert_eq!(status_for("GET", "/openapi.json").await, StatusCode::OK);
    }
}
