pub mod creation;
pub mod existing;
pub mod filesystem;
pub mod fits;


use std::path::PathBuf;

use crate::services::fits::ReadError;

/// Input the service refused before touching the filesystem or database.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error("Requested path {} is not within the map directory", .requested.display())]
    PathTraversal { requested: PathBuf },
    #[error("File {} does not have an allowed extension", .path.display())]
    DisallowedExtension { path: PathBuf },
    #[error("Path {} is not a directory", .path.display())]
    NotADirectory { path: PathBuf },
    #[error("Path {} is not a readable file", .path.display())]
    NotAFile { path: PathBuf },
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("{0}")]
    NotFound(String),
    #[error("unreadable data file {}: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: ReadError,
    },
    #[error("layers {missing:?} not found in {}", .path.display())]
    LayersNotFound { path: PathBuf, missing: Vec<String> },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Runs blocking filesystem work off the async executor.
pub(crate) async fn run_blocking<T, F>(work: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ServiceError::Internal(format!("blocking task failed: {err}")))?
}
