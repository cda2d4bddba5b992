//! Authoritative user directory: trait seam and the UserInfo GraphQL client.

pub mod userinfo;

pub use userinfo::UserInfoClient;

use crate::models::UserRecord;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("directory returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode directory response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("directory reported errors: {0}")]
    Query(String),
}

/// Source of current user records for a scope.
#[async_trait]
pub trait DirectorySource: Send + Sync {
    /// Records sorted ascending by email, unique by email.
    async fn fetch_users(&self, scope: &str) -> Result<Vec<UserRecord>, DirectoryError>;
}

/// Sort by email (byte order) and collapse duplicate emails, keeping the first.
pub fn normalize_users(mut users: Vec<UserRecord>) -> Vec<UserRecord> {
    users.sort_by(|a, b| a.email.cmp(&b.email));
    let before = users.len();
    users.dedup_by(|later, earlier| {
        let duplicate = later.email == earlier.email;
        if duplicate {
            log::warn!(
                "directory returned duplicate email {} (ids {} and {}), keeping {}",
                earlier.email,
                earlier.id,
                later.id,
                earlier.id
            );
        }
        duplicate
    });
    if users.len() != before {
        log::warn!("collapsed {} duplicate directory entries", before - users.len());
    }
    users
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_sorts_and_dedups() {
        let users = vec![
            UserRecord::new("3", "c@x.gov"),
            UserRecord::new("1", "a@x.gov"),
            UserRecord::new("2", "c@x.gov"),
        ];
        let normalized = normalize_users(users);
        let emails: Vec<_> = normalized.iter().map(|u| u.email.as_str()).collect();
        assert_eq!(emails, vec!["a@x.gov", "c@x.gov"]);
        assert_eq!(normalized[1].id, "3");
    }
}
