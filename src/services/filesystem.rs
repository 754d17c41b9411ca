//! Sandboxed reads below the configured map directory.
//!
//! Every request path is first resolved lexically against the root, so `..`
//! escapes are rejected before the filesystem is consulted, and then
//! re-checked after canonicalization so symlinks cannot point outside it.

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

use crate::config::is_allowed_extension;
use crate::services::fits::{LayerDescriptor, LayerReader};
use crate::services::{Rejection, ServiceError, ServiceResult};

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct DirectoryListing {
    /// Matching data files, relative to the map directory.
    pub files: Vec<String>,
    /// Sub-directories, relative to the map directory.
    pub directories: Vec<String>,
    /// Name of the listed directory; absent when listing the root.
    pub requested_directory: Option<String>,
    /// Parent of the listed directory relative to the root (empty for the root itself).
    pub parent_directory: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    extensions: Vec<String>,
}

impl Sandbox {
    pub fn new(root: PathBuf, extensions: Vec<String>) -> Self {
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            extensions: crate::config::normalize_extensions(&extensions),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Joins `requested` onto the root and normalizes it without touching disk.
    pub fn resolve(&self, requested: Option<&Path>) -> Result<PathBuf, Rejection> {
        let Some(requested) = requested else {
            return Ok(self.root.clone());
        };
        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(Rejection::PathTraversal {
                            requested: requested.to_path_buf(),
                        });
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }

        if !normalized.starts_with(&self.root) {
            return Err(Rejection::PathTraversal {
                requested: requested.to_path_buf(),
            });
        }
        Ok(normalized)
    }

    /// Canonicalizes `resolved` and re-checks containment. Failures other than
    /// a missing path are reported through `unusable`.
    fn canonical_within(
        &self,
        resolved: &Path,
        requested: &Path,
        unusable: fn(PathBuf) -> Rejection,
    ) -> ServiceResult<PathBuf> {
        let canonical = resolved.canonicalize().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ServiceError::NotFound(format!("Path {} not found", requested.display()))
            } else {
                ServiceError::Rejected(unusable(requested.to_path_buf()))
            }
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(Rejection::PathTraversal {
                requested: requested.to_path_buf(),
            }
            .into());
        }
        Ok(canonical)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Lists world-readable sub-directories and allow-listed files of `requested`.
    pub fn list_directory(&self, requested: Option<&Path>) -> ServiceResult<DirectoryListing> {
        let resolved = self.resolve(requested)?;
        let requested = requested.unwrap_or(Path::new(""));
        let dir = self.canonical_within(&resolved, requested, |path| {
            Rejection::NotADirectory { path }
        })?;
        if !dir.is_dir() {
            return Err(Rejection::NotADirectory {
                path: requested.to_path_buf(),
            }
            .into());
        }

        let entries = std::fs::read_dir(&dir).map_err(|err| {
            tracing::warn!(path = %dir.display(), error = %err, "failed to read directory");
            ServiceError::Rejected(Rejection::NotADirectory {
                path: requested.to_path_buf(),
            })
        })?;

        let mut files = Vec::new();
        let mut directories = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = dir.join(name);
            let Ok(target) = path.canonicalize() else {
                continue;
            };
            if !target.starts_with(&self.root) {
                continue;
            }
            let Ok(metadata) = std::fs::metadata(&target) else {
                continue;
            };
            if !world_readable(&metadata) {
                continue;
            }
            if metadata.is_dir() {
                directories.push(self.relative(&path));
            } else if metadata.is_file() && is_allowed_extension(&path, &self.extensions) {
                files.push(self.relative(&path));
            }
        }
        files.sort();
        directories.sort();

        let (requested_directory, parent_directory) = if dir == self.root {
            (None, None)
        } else {
            (
                dir.file_name().map(|name| name.to_string_lossy().to_string()),
                dir.parent().map(|parent| self.relative(parent)),
            )
        };

        Ok(DirectoryListing {
            files,
            directories,
            requested_directory,
            parent_directory,
        })
    }

    /// Resolves `requested` to an allow-listed regular file inside the root.
    pub fn resolve_file(&self, requested: &Path) -> ServiceResult<PathBuf> {
        let resolved = self.resolve(Some(requested))?;
        if !is_allowed_extension(&resolved, &self.extensions) {
            return Err(Rejection::DisallowedExtension {
                path: requested.to_path_buf(),
            }
            .into());
        }
        let canonical =
            self.canonical_within(&resolved, requested, |path| Rejection::NotAFile { path })?;
        if !is_allowed_extension(&canonical, &self.extensions) {
            return Err(Rejection::DisallowedExtension {
                path: requested.to_path_buf(),
            }
            .into());
        }
        if !canonical.is_file() {
            return Err(Rejection::NotAFile {
                path: requested.to_path_buf(),
            }
            .into());
        }
        Ok(canonical)
    }
}

/// Re-validates `requested` and reads its layers. Containment is checked here
/// even when the caller already listed the file.
pub fn safe_evaluate(
    sandbox: &Sandbox,
    reader: &dyn LayerReader,
    requested: &Path,
) -> ServiceResult<Vec<LayerDescriptor>> {
    let path = sandbox.resolve_file(requested)?;
    reader
        .read_layers(&path)
        .map_err(|source| ServiceError::Unreadable {
            path: requested.to_path_buf(),
            source,
        })
}

#[cfg(unix)]
fn world_readable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o004 != 0
}

#[cfg(not(unix))]
fn world_readable(_metadata: &Metadata) -> bool {
    true
}
