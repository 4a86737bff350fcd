//! File-backed persistence for credentials and pool state.
//!
//! All read-modify-write cycles on shared JSON files happen under an fs2
//! advisory lock so concurrent refreshes across processes never tear a file.

mod credential_store;
mod pool_file;

pub use credential_store::{CredentialStore, TokenUpdate};
pub use pool_file::PoolFile;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid base64 credential bundle: {0}")]
    Base64(String),
    #[error("timestamp format error: {0}")]
    Timestamp(String),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.display().to_string(),
            source,
        }
    }
}
