use std::error::Error as StdError;
use std::path::{Path, PathBuf};

/// Errors raised while synchronizing the listing feed.
///
/// Only `FeedAuth` is fatal for a whole run; every other variant aborts the
/// property type being processed and the run moves on to the next one.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("feed authentication failed for {username}: {reason}")]
    FeedAuth { username: String, reason: String },

    #[error("feed request failed: {context}")]
    FeedTransport {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("malformed feed xml at byte {position}: {message}")]
    Parse { position: u64, message: String },

    #[error("multipart boundary not found in content type {content_type:?}")]
    PhotoBoundary { content_type: Option<String> },

    #[error("storage error: {context}")]
    Storage {
        context: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("filesystem error at {}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("unknown property type: {0}")]
    UnknownPropertyType(String),

    #[error("run incomplete, failed property types: {}", failed.join(", "))]
    Incomplete { failed: Vec<String> },
}

impl SyncError {
    pub fn transport(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::FeedTransport {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn storage(context: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn filesystem(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether the error must stop the whole run rather than a single property type.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FeedAuth { .. })
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
