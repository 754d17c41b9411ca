use crate::auth::AuthenticatedUser;
use crate::config::{
    AdminConfig, AuthType, DEFAULT_COLORMAPS, DEFAULT_EXTENSIONS, DEFAULT_MOCK_GRANTS,
};
use crate::db;
use crate::services::fits::LayerReader;
use crate::state::AppState;
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Config whose map directory is never created, for states that never list files.
pub fn test_config_without_maps() -> AdminConfig {
    AdminConfig {
        auth_type: AuthType::Mock,
        authentication_base_url: "http://127.0.0.1:9".to_string(),
        app_base_url: "http://localhost:8000".to_string(),
        app_id: None,
        client_secret: None,
        public_key: None,
        key_pair_type: "Ed25519".to_string(),
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        map_directory: std::env::temp_dir().join("tileadder-test-unused-maps"),
        extensions: strings(DEFAULT_EXTENSIONS),
        colormaps: strings(DEFAULT_COLORMAPS),
        mock_grants: strings(DEFAULT_MOCK_GRANTS),
        tile_size: 256,
        static_root: None,
    }
}

/// Config backed by a fresh map directory, removed when the returned guard drops.
pub fn test_config() -> (AdminConfig, TempDir) {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config_without_maps();
    config.map_directory = tempdir.path().to_path_buf();
    (config, tempdir)
}

/// State over a lazy pool; handlers that reach the database will fail to connect.
pub fn test_state_with(config: AdminConfig) -> AppState {
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    AppState::new(config, pool, reqwest::Client::new())
}

pub fn test_state() -> AppState {
    test_state_with(test_config_without_maps())
}

pub fn test_state_with_reader(config: AdminConfig, reader: Arc<dyn LayerReader>) -> AppState {
    let mut state = test_state_with(config);
    state.reader = reader;
    state
}

pub fn test_user_with_grants(grants: &[&str]) -> AuthenticatedUser {
    let grants: HashSet<String> = grants.iter().map(|grant| grant.to_string()).collect();
    AuthenticatedUser {
        name: "test-user".to_string(),
        grants,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_directory_is_removed_with_its_guard() {
        let (config, dir) = test_config();
        assert!(config.map_directory.is_dir());
        drop(dir);
        assert!(!config.map_directory.exists());
    }
}
