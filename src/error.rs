//! Error taxonomy for the CAS core (see §7 of the design).
//!
//! Every public operation returns [`CasError`] so callers outside this
//! crate (a CLI, an HTTP front end, a fetcher) can match on the kind
//! instead of parsing message strings.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CasError {
    #[error("invalid key '{0}'")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("key prefix '{0}' matches {1} blobs")]
    AmbiguousKey(String, usize),

    #[error("decompression failed: {0}")]
    DecompressionError(#[source] std::io::Error),

    #[error("invalid image manifest: {0}")]
    ManifestError(anyhow::Error),

    #[error("failed to import blob into the store: {0}")]
    ImportError(#[source] std::io::Error),

    #[error("metadata index error: {0}")]
    IndexError(anyhow::Error),

    #[error("rendered tree has a path collision at {0:?}")]
    RenderOverwriteError(PathBuf),

    #[error("dependency registry violated ordering/containment contract: {0}")]
    RenderOrderError(String),

    #[error("failed to remove {} store entries", .0.len())]
    RemovalError(Vec<(PathBuf, std::io::Error)>),

    #[error("store schema version {stored} is newer than the version this build supports ({expected})")]
    FutureSchemaError { stored: i64, expected: i64 },
}

pub type Result<T> = std::result::Result<T, CasError>;

impl From<rusqlite::Error> for CasError {
    fn from(err: rusqlite::Error) -> Self {
        CasError::IndexError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for CasError {
    fn from(err: std::io::Error) -> Self {
        CasError::ImportError(err)
    }
}
