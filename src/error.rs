use thiserror::Error;

use crate::constants::FILEMAP_VERSION;

/// Failures raised by the shard store and its transports.
///
/// Retries happen inside the store; by the time one of these surfaces, the
/// bounded attempt budget is already spent. All fields are plain data so the
/// error can flow out of a coalesced (`Shared`) fetch to every awaiter.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("fetching {url} failed after {attempts} attempts: {reason}")]
    Fetch {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("shard not found: {0}")]
    NotFound(String),
    #[error("{path}: {reason}")]
    Io { path: String, reason: String },
}

impl StoreError {
    pub fn io(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        StoreError::Io {
            path: path.as_ref().to_string_lossy().into_owned(),
            reason: err.to_string(),
        }
    }
}

/// Failures loading or validating a filemap document.
#[derive(Debug, Clone, Error)]
pub enum FilemapError {
    #[error("unsupported filemap version {0}, this build understands {FILEMAP_VERSION}")]
    Version(u64),
    #[error("filemap schema violation: {0}")]
    Schema(String),
    #[error("filemap is not valid JSON: {0}")]
    Json(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures materializing logical files through the direct resolve API.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("manifest \"{0}\" is not present in the filemap")]
    UnknownManifest(String),
    #[error("no filemap available for source {0}")]
    NoFilemap(String),
    #[error("checksum mismatch for {path}: manifest says {expected}, file hashed to {actual}")]
    Checksum {
        path: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Filemap(#[from] FilemapError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{path}: {reason}")]
    Io { path: String, reason: String },
}

#[cfg(not(target_arch = "wasm32"))]
impl ResolveError {
    pub fn io(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        ResolveError::Io {
            path: path.as_ref().to_string_lossy().into_owned(),
            reason: err.to_string(),
        }
    }
}

/// Failures producing a package. Configuration and collision errors are
/// fatal before anything is written; the filemap itself is only written
/// after every entry succeeded, so no failure publishes a corrupt document.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Debug, Error)]
pub enum PackError {
    #[error("cdn object name collision: {name} wanted by {a} and {b}")]
    Collision { name: String, a: String, b: String },
    #[error("not enough disk space in {volume}: need {needed} bytes, {available} available")]
    DiskSpace {
        volume: String,
        needed: u64,
        available: u64,
    },
    #[error("required tool not available: {0}")]
    MissingTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("{path}: {reason}")]
    Io { path: String, reason: String },
}

#[cfg(not(target_arch = "wasm32"))]
impl PackError {
    pub fn io(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        PackError::Io {
            path: path.as_ref().to_string_lossy().into_owned(),
            reason: err.to_string(),
        }
    }
}
