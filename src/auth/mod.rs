use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use reqwest::Client;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{AdminConfig, AuthType};
use crate::error::{AppError, AppResult};

pub const GRANT_ADD: &str = "maps:add";
pub const GRANT_EDIT: &str = "maps:edit";
pub const GRANT_ADMIN: &str = "maps:admin";

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub name: String,
    pub grants: HashSet<String>,
}

#[derive(Debug, serde::Serialize)]
struct IntrospectionRequest<'a> {
    token: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    user_name: Option<String>,
    #[serde(default)]
    grants: Vec<String>,
}

/// Resolves bearer tokens to users. Mock mode hands every request the
/// configured grants; soauth mode introspects each token with the identity
/// service, authenticating as the registered app.
#[derive(Debug)]
pub struct AuthManager {
    mode: AuthType,
    mock_grants: HashSet<String>,
    introspect_url: String,
    app_id: Option<Uuid>,
    client_secret: Option<String>,
    http: Client,
}

impl AuthManager {
    pub fn from_config(config: &AdminConfig, http: Client) -> Self {
        Self {
            mode: config.auth_type,
            mock_grants: config.mock_grants.iter().cloned().collect(),
            introspect_url: format!(
                "{}/introspect",
                config.authentication_base_url.trim_end_matches('/')
            ),
            app_id: config.app_id,
            client_secret: config.client_secret.clone(),
            http,
        }
    }

    pub fn mode(&self) -> AuthType {
        self.mode
    }

    pub async fn authenticate(&self, token: Option<&str>) -> AppResult<AuthenticatedUser> {
        match self.mode {
            AuthType::Mock => Ok(AuthenticatedUser {
                name: "mock".to_string(),
                grants: self.mock_grants.clone(),
            }),
            AuthType::Soauth => {
                let token =
                    token.ok_or_else(|| AppError::unauthorized("Missing or invalid token"))?;
                self.introspect(token).await
            }
        }
    }

    async fn introspect(&self, token: &str) -> AppResult<AuthenticatedUser> {
        let mut request = self
            .http
            .post(&self.introspect_url)
            .json(&IntrospectionRequest { token });
        if let Some(app_id) = self.app_id {
            request = request.basic_auth(app_id, self.client_secret.as_deref());
        }
        let response = request.send().await.map_err(|err| {
            tracing::error!(error = %err, url = %self.introspect_url, "identity service unreachable");
            AppError::internal("Identity service unavailable")
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            tracing::error!(status = %status, "identity service rejected the app credentials");
            return Err(AppError::internal("Identity service unavailable"));
        }
        if !status.is_success() {
            tracing::error!(status = %status, "identity service returned an error");
            return Err(AppError::internal("Identity service unavailable"));
        }

        let body: IntrospectionResponse = response.json().await.map_err(|err| {
            tracing::error!(error = %err, "identity service returned malformed JSON");
            AppError::internal("Identity service unavailable")
        })?;
        user_from_introspection(body)
    }
}

fn user_from_introspection(body: IntrospectionResponse) -> AppResult<AuthenticatedUser> {
    if !body.active {
        return Err(AppError::unauthorized("Missing or invalid token"));
    }
    Ok(AuthenticatedUser {
        name: body.user_name.unwrap_or_else(|| "unknown".to_string()),
        grants: body.grants.into_iter().collect(),
    })
}

fn bearer_token(parts: &Parts) -> Result<Option<String>, AppError> {
    let Some(value) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| Some(value.to_string()))
        .ok_or_else(|| AppError::unauthorized("Missing or invalid token"))
}

#[derive(Debug, Clone)]
pub struct AuthUser(pub AuthenticatedUser);

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<AuthManager>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let manager = Arc::<AuthManager>::from_ref(state);
        // Mock mode ignores whatever Authorization header the browser sends.
        let token_result = match manager.mode() {
            AuthType::Mock => Ok(None),
            AuthType::Soauth => bearer_token(parts),
        };

        async move {
            let token = token_result?;
            let user = manager.authenticate(token.as_deref()).await?;
            Ok(AuthUser(user))
        }
    }
}

pub fn require_grants(user: &AuthenticatedUser, required: &[&str]) -> AppResult<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|grant| !user.grants.contains(*grant))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(AppError::forbidden(format!(
        "Missing grants: {}",
        missing.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, test_user_with_grants};
    use axum::http::{Request, StatusCode};

    fn request_parts(authorization: &str) -> Parts {
        let (parts, _) = Request::builder()
            .uri("/add")
            .header(AUTHORIZATION, authorization)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn require_grants_reports_missing_grants() {
        let user = test_user_with_grants(&[GRANT_ADD]);

        let err = require_grants(&user, &[GRANT_ADD, GRANT_ADMIN]).unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert!(err.message.contains(GRANT_ADMIN));
        assert!(!err.message.contains(GRANT_ADD));
    }

    #[test]
    fn require_grants_allows_present_grants() {
        let user = test_user_with_grants(&[GRANT_EDIT, GRANT_ADMIN]);
        assert!(require_grants(&user, &[GRANT_EDIT]).is_ok());
        assert!(require_grants(&user, &[]).is_ok());
    }

    #[tokio::test]
    async fn mock_mode_grants_configured_scopes_without_a_token() {
        let (mut config, _dir) = test_config();
        config.mock_grants = vec![GRANT_ADD.to_string()];
        let manager = AuthManager::from_config(&config, Client::new());

        let user = manager.authenticate(None).await.unwrap();
        assert_eq!(user.name, "mock");
        assert!(user.grants.contains(GRANT_ADD));
        assert!(!user.grants.contains(GRANT_ADMIN));
    }

    #[tokio::test]
    async fn mock_mode_ignores_non_bearer_authorization_headers() {
        let (config, _dir) = test_config();
        let manager = Arc::new(AuthManager::from_config(&config, Client::new()));

        let mut parts = request_parts("Basic abc");
        let AuthUser(user) = AuthUser::from_request_parts(&mut parts, &manager)
            .await
            .unwrap();
        assert!(user.grants.contains(GRANT_ADMIN));
    }

    #[tokio::test]
    async fn soauth_mode_rejects_non_bearer_authorization_headers() {
        let (mut config, _dir) = test_config();
        config.auth_type = AuthType::Soauth;
        let manager = Arc::new(AuthManager::from_config(&config, Client::new()));

        let mut parts = request_parts("Basic abc");
        let err = AuthUser::from_request_parts(&mut parts, &manager)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn soauth_mode_requires_a_token() {
        let (mut config, _dir) = test_config();
        config.auth_type = AuthType::Soauth;
        let manager = AuthManager::from_config(&config, Client::new());

        let err = manager.authenticate(None).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unreachable_identity_service_is_an_internal_error() {
        let (mut config, _dir) = test_config();
        config.auth_type = AuthType::Soauth;
        config.app_id = Some(Uuid::new_v4());
        config.client_secret = Some("secret".to_string());
        let manager = AuthManager::from_config(&config, Client::new());

        let err = manager.authenticate(Some("token-1")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn introspection_url_trims_trailing_slash() {
        let (mut config, _dir) = test_config();
        config.authentication_base_url = "https://identity.example.org/".to_string();
        let manager = AuthManager::from_config(&config, Client::new());
        assert_eq!(manager.introspect_url, "https://identity.example.org/introspect");
    }

    #[test]
    fn inactive_tokens_are_unauthorized() {
        let body: IntrospectionResponse =
            serde_json::from_value(serde_json::json!({ "active": false, "user_name": "ada" }))
                .unwrap();
        let err = user_from_introspection(body).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let body: IntrospectionResponse = serde_json::from_value(serde_json::json!({
            "active": true,
            "user_name": "ada",
            "grants": [GRANT_EDIT]
        }))
        .unwrap();
        let user = user_from_introspection(body).unwrap();
        assert_eq!(user.name, "ada");
        assert!(user.grants.contains(GRANT_EDIT));
    }
}
