use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure inside the cache itself. Never surfaced to callers of
/// `get_or_compute`; it degrades to a miss.
#[derive(Debug, Error)]
pub enum CacheFault {
    #[error("cache i/o on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize cached value: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupted cache entry `{key}`: {reason}")]
    Corrupted { key: String, reason: String },
    #[error("cache worker failed: {0}")]
    Task(String),
}

impl CacheFault {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupted(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Stable label used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
            Self::Serialize(_) => "serialize",
            Self::Corrupted { .. } => "corrupted",
            Self::Task(_) => "task",
        }
    }
}
