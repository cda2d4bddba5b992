use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::models::CategoricalField;
use crate::remote::RemoteError;
use crate::store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by a reconciliation run.
///
/// The orchestrator is the only place that turns one of these into an abort;
/// everything below it just propagates.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("directory fetch failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("remote call failed for {email}: {source}")]
    Remote {
        email: String,
        #[source]
        source: RemoteError,
    },
    #[error("invalid entry for {email}: {field} value '{value}' has no configured answer")]
    InvalidEntry {
        email: String,
        field: CategoricalField,
        value: String,
    },
    #[error("too many removals, manual verification required ({count} scheduled, limit {limit})")]
    TooManyRemovals { count: usize, limit: usize },
    #[error(
        "{list} list is not strictly ascending by email at position {position} ('{previous}' then '{current}')"
    )]
    UnsortedInput {
        list: &'static str,
        position: usize,
        previous: String,
        current: String,
    },
    #[error("throttle closed")]
    ThrottleClosed,
    #[error("apply task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn remote(email: impl Into<String>, source: RemoteError) -> Self {
        SyncError::Remote {
            email: email.into(),
            source,
        }
    }

    /// Soft conditions skip the affected record but never abort the run.
    pub fn is_soft(&self) -> bool {
        matches!(self, SyncError::Remote { source, .. } if source.is_soft())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        SyncError::Task(err.to_string())
    }
}
