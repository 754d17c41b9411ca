use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_EXTENSIONS: &[&str] = &["fits"];
pub const DEFAULT_MOCK_GRANTS: &[&str] = &["maps:add", "maps:edit", "maps:admin"];
pub const DEFAULT_COLORMAPS: &[&str] = &[
    "viridis", "plasma", "inferno", "magma", "cividis", "gray", "grey", "binary", "RdBu_r",
    "RdBu", "coolwarm", "seismic", "planck", "afmhot", "hot", "cubehelix", "twilight",
];
const DEFAULT_AUTHENTICATION_BASE_URL: &str = "https://identity.simonsobservatory.org";
const DEFAULT_APP_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TILE_SIZE: u32 = 256;
const DEFAULT_KEY_PAIR_TYPE: &str = "Ed25519";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Every request is authenticated as a local user holding the configured mock grants.
    Mock,
    /// Bearer tokens are resolved against the external identity provider.
    Soauth,
}

impl AuthType {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "soauth" => Ok(Self::Soauth),
            other => anyhow::bail!("TILEADDER_AUTH_TYPE must be 'soauth' or 'mock' (got '{other}')"),
        }
    }
}

pub(crate) fn config_override_path() -> Option<PathBuf> {
    env_optional_path("TILEADDER_CONFIG_PATH")
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigOverrides {
    #[serde(default)]
    auth_type: Option<String>,
    #[serde(default)]
    authentication_base_url: Option<String>,
    #[serde(default)]
    app_base_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    map_directory: Option<String>,
    #[serde(default)]
    extensions: Option<Vec<String>>,
    #[serde(default)]
    colormaps: Option<Vec<String>>,
    #[serde(default)]
    tile_size: Option<u32>,
}

fn load_config_overrides() -> Option<ConfigOverrides> {
    let path = config_override_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config override file not found; using env only");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config override file; using env only"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse config override file; using env only"
            );
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub auth_type: AuthType,
    pub authentication_base_url: String,
    pub app_base_url: String,
    pub app_id: Option<Uuid>,
    pub client_secret: Option<String>,
    /// PEM public key of the identity service signing pair.
    pub public_key: Option<String>,
    pub key_pair_type: String,
    pub database_url: String,
    pub map_directory: PathBuf,
    pub extensions: Vec<String>,
    pub colormaps: Vec<String>,
    pub mock_grants: Vec<String>,
    pub tile_size: u32,
    pub static_root: Option<PathBuf>,
}

impl AdminConfig {
    pub fn from_env(cli_static_root: Option<PathBuf>) -> Result<Self> {
        let overrides = load_config_overrides().unwrap_or_default();

        let auth_type = env_optional_string("TILEADDER_AUTH_TYPE")
            .or_else(|| non_empty(overrides.auth_type.as_deref()))
            .map(|value| AuthType::parse(&value))
            .transpose()?
            .unwrap_or(AuthType::Mock);

        let authentication_base_url = env_optional_string("TILEADDER_AUTHENTICATION_BASE_URL")
            .or_else(|| non_empty(overrides.authentication_base_url.as_deref()))
            .unwrap_or_else(|| DEFAULT_AUTHENTICATION_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let app_base_url = env_optional_string("TILEADDER_APP_BASE_URL")
            .or_else(|| non_empty(overrides.app_base_url.as_deref()))
            .unwrap_or_else(|| DEFAULT_APP_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let app_id = env_secret("TILEADDER_APP_ID", "TILEADDER_APP_ID_FILENAME")?
            .map(|value| {
                Uuid::parse_str(&value).context("TILEADDER_APP_ID must be a UUID")
            })
            .transpose()?;
        let client_secret =
            env_secret("TILEADDER_CLIENT_SECRET", "TILEADDER_CLIENT_SECRET_FILENAME")?;
        let public_key = env_secret("TILEADDER_PUBLIC_KEY", "TILEADDER_PUBLIC_KEY_FILENAME")?;
        let key_pair_type = env_optional_string("TILEADDER_KEY_PAIR_TYPE")
            .unwrap_or_else(|| DEFAULT_KEY_PAIR_TYPE.to_string());

        let database_url = env_optional_string("TILEADDER_DATABASE_URL")
            .or_else(|| non_empty(overrides.database_url.as_deref()))
            .context("TILEADDER_DATABASE_URL must be set (or present as database_url in the config override file)")?;
        let database_url = normalize_database_url(database_url);

        let map_directory = env_optional_string("TILEADDER_MAP_DIRECTORY")
            .or_else(|| non_empty(overrides.map_directory.as_deref()))
            .map(PathBuf::from)
            .context("TILEADDER_MAP_DIRECTORY must be set to the directory holding map files")?;

        let extensions = env_list("TILEADDER_EXTENSIONS")
            .or(overrides.extensions)
            .unwrap_or_else(|| to_strings(DEFAULT_EXTENSIONS));
        let colormaps = env_list("TILEADDER_COLORMAPS")
            .or(overrides.colormaps)
            .unwrap_or_else(|| to_strings(DEFAULT_COLORMAPS));
        let mock_grants =
            env_list("TILEADDER_MOCK_GRANTS").unwrap_or_else(|| to_strings(DEFAULT_MOCK_GRANTS));
        let tile_size = env_optional_string("TILEADDER_TILE_SIZE")
            .and_then(|value| value.parse::<u32>().ok())
            .or(overrides.tile_size)
            .unwrap_or(DEFAULT_TILE_SIZE)
            .clamp(16, 4096);
        let static_root = cli_static_root.or_else(|| env_optional_path("TILEADDER_STATIC_ROOT"));

        let mut config = Self {
            auth_type,
            authentication_base_url,
            app_base_url,
            app_id,
            client_secret,
            public_key,
            key_pair_type,
            database_url,
            map_directory,
            extensions,
            colormaps,
            mock_grants,
            tile_size,
            static_root,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("TILEADDER_DATABASE_URL resolved to an empty value");
        }
        self.extensions = normalize_extensions(&self.extensions);
        if self.extensions.is_empty() {
            anyhow::bail!("TILEADDER_EXTENSIONS must name at least one extension");
        }
        if self.colormaps.is_empty() {
            anyhow::bail!("TILEADDER_COLORMAPS must name at least one colormap");
        }
        if self.auth_type == AuthType::Soauth {
            validate_soauth_credentials(self)?;
        }
        self.map_directory =
            validate_map_directory(self.map_directory.clone(), "TILEADDER_MAP_DIRECTORY")?;
        Ok(())
    }
}

/// Lowercases extensions and strips leading dots so `.FITS` and `fits` compare equal.
pub(crate) fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    let mut out: Vec<String> = extensions
        .iter()
        .map(|ext| ext.trim().trim_start_matches('.').to_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();
    out.dedup();
    out
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_optional_path(key: &str) -> Option<PathBuf> {
    env_optional_string(key).map(PathBuf::from)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env_optional_string(key)?;
    let values: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

/// Reads a secret from `key`, falling back to the contents of the file named by `file_key`.
fn env_secret(key: &str, file_key: &str) -> Result<Option<String>> {
    if let Some(value) = env_optional_string(key) {
        return Ok(Some(value));
    }
    let Some(path) = env_optional_path(file_key) else {
        return Ok(None);
    };
    if !path.exists() {
        tracing::warn!(path = %path.display(), "{file_key} points at a missing file");
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {file_key} ({})", path.display()))?;
    Ok(non_empty(Some(&contents)))
}

fn validate_soauth_credentials(config: &AdminConfig) -> Result<()> {
    if config.app_id.is_none() {
        anyhow::bail!("TILEADDER_APP_ID (or TILEADDER_APP_ID_FILENAME) is required when TILEADDER_AUTH_TYPE=soauth");
    }
    if config.client_secret.is_none() {
        anyhow::bail!("TILEADDER_CLIENT_SECRET (or TILEADDER_CLIENT_SECRET_FILENAME) is required when TILEADDER_AUTH_TYPE=soauth");
    }
    let Some(public_key) = config.public_key.as_deref() else {
        anyhow::bail!("TILEADDER_PUBLIC_KEY (or TILEADDER_PUBLIC_KEY_FILENAME) is required when TILEADDER_AUTH_TYPE=soauth");
    };
    if !(public_key.starts_with("-----BEGIN ") && public_key.contains("PUBLIC KEY-----")) {
        anyhow::bail!("TILEADDER_PUBLIC_KEY must be a PEM-encoded public key");
    }
    if config.key_pair_type.trim().is_empty() {
        anyhow::bail!("TILEADDER_KEY_PAIR_TYPE must not be empty");
    }
    Ok(())
}

fn validate_map_directory(path: PathBuf, label: &str) -> Result<PathBuf> {
    if !path.is_absolute() {
        anyhow::bail!("{label} must be an absolute path");
    }
    for component in path.components() {
        if matches!(component, Component::ParentDir) {
            anyhow::bail!("{label} must not contain '..' segments");
        }
    }
    let canonical = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {label} ({})", path.display()))?;
    if !canonical.is_dir() {
        anyhow::bail!("{label} must be a directory ({})", canonical.display());
    }
    Ok(canonical)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

pub(crate) fn is_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    let lowered = name.to_lowercase();
    extensions
        .iter()
        .any(|ext| lowered.len() > ext.len() + 1 && lowered.ends_with(&format!(".{ext}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_type() {
        assert_eq!(AuthType::parse("mock").unwrap(), AuthType::Mock);
        assert_eq!(AuthType::parse(" SOAUTH ").unwrap(), AuthType::Soauth);
        assert!(AuthType::parse("oauth2").is_err());
    }

    #[test]
    fn normalizes_sqlalchemy_style_urls() {
        assert_eq!(
            normalize_database_url("postgresql+psycopg://u@h/db".to_string()),
            "postgresql://u@h/db"
        );
        assert_eq!(
            normalize_database_url("postgres://u@h/db".to_string()),
            "postgres://u@h/db"
        );
    }

    #[test]
    fn normalizes_extension_list() {
        let normalized = normalize_extensions(&[
            ".FITS".to_string(),
            "fits".to_string(),
            " ".to_string(),
            "fits.gz".to_string(),
        ]);
        assert_eq!(normalized, vec!["fits".to_string(), "fits.gz".to_string()]);
    }

    #[test]
    fn matches_allowed_extensions_case_insensitively() {
        let exts = vec!["fits".to_string()];
        assert!(is_allowed_extension(Path::new("maps/survey.fits"), &exts));
        assert!(is_allowed_extension(Path::new("SURVEY.FITS"), &exts));
        assert!(!is_allowed_extension(Path::new("survey.fits.txt"), &exts));
        assert!(!is_allowed_extension(Path::new(".fits"), &exts));
        assert!(!is_allowed_extension(Path::new("notes.txt"), &exts));
    }

    #[test]
    fn soauth_requires_credentials_and_a_pem_public_key() {
        let (mut config, _dir) = crate::test_support::test_config();
        config.auth_type = AuthType::Soauth;
        assert!(validate_soauth_credentials(&config).is_err());

        config.app_id = Some(Uuid::new_v4());
        config.client_secret = Some("secret".to_string());
        config.public_key = Some("not a key".to_string());
        let err = validate_soauth_credentials(&config).unwrap_err();
        assert!(err.to_string().contains("PEM"));

        config.public_key = Some(
            "-----BEGIN PUBLIC KEY-----\nMCowBQYDK2VwAyEA\n-----END PUBLIC KEY-----".to_string(),
        );
        assert!(validate_soauth_credentials(&config).is_ok());
        assert_eq!(config.key_pair_type, "Ed25519");
    }

    #[test]
    fn rejects_relative_or_parent_map_directories() {
        assert!(validate_map_directory(PathBuf::from("relative/maps"), "TEST").is_err());
        assert!(validate_map_directory(PathBuf::from("/tmp/../etc"), "TEST").is_err());
    }

    #[test]
    fn canonicalizes_map_directory() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let maps = temp.path().join("maps");
        std::fs::create_dir_all(&maps)?;

        let resolved = validate_map_directory(maps.clone(), "TEST")?;
        assert_eq!(resolved, maps.canonicalize()?);
        Ok(())
    }

    #[test]
    fn rejects_map_directory_that_is_a_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let file = temp.path().join("survey.fits");
        std::fs::write(&file, b"SIMPLE")?;

        assert!(validate_map_directory(file, "TEST").is_err());
        Ok(())
    }
}
