use crate::auth::AuthManager;
use crate::config::AdminConfig;
use crate::services::filesystem::Sandbox;
use crate::services::fits::{FitsLayerReader, LayerReader};
use axum::extract::FromRef;
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: AdminConfig,
    pub db: PgPool,
    pub auth: Arc<AuthManager>,
    pub sandbox: Sandbox,
    pub reader: Arc<dyn LayerReader>,
}

impl AppState {
    /// Wires the collaborators every handler needs around an already built pool.
    /// `http` is the client used for identity service calls.
    pub fn new(config: AdminConfig, db: PgPool, http: Client) -> Self {
        let auth = Arc::new(AuthManager::from_config(&config, http));
        let sandbox = Sandbox::new(config.map_directory.clone(), config.extensions.clone());
        let reader: Arc<dyn LayerReader> = Arc::new(FitsLayerReader::new(config.tile_size));
        Self {
            config,
            db,
            auth,
            sandbox,
            reader,
        }
    }
}

impl FromRef<AppState> for Arc<AuthManager> {
    fn from_ref(state: &AppState) -> Arc<AuthManager> {
        state.auth.clone()
    }
}

impl FromRef<AppState> for PgPool {
    fn from_ref(state: &AppState) -> PgPool {
        state.db.clone()
    }
}
