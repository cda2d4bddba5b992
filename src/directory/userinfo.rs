use super::{DirectoryError, DirectorySource, normalize_users};
use crate::config::DirectoryConfig;
use crate::models::UserRecord;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// GraphQL client for the UserInfo directory service.
#[derive(Clone)]
pub struct UserInfoClient {
    http: reqwest::Client,
    config: DirectoryConfig,
}

impl UserInfoClient {
    pub fn new(config: DirectoryConfig) -> Result<Self, DirectoryError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent("subscriber-sync/0.1")
            .build()?;

        Ok(Self {
            http: client,
            config,
        })
    }

    fn query(scope: &str) -> String {
        let scope = scope.replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            "{{ users(ic: \"{scope}\") {{ ned_id, inactive, email, sac, status, division, building }} }}"
        )
    }
}

#[async_trait]
impl DirectorySource for UserInfoClient {
    async fn fetch_users(&self, scope: &str) -> Result<Vec<UserRecord>, DirectoryError> {
        let response = self
            .http
            .post(&self.config.graphql_url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .header(reqwest::header::CONTENT_TYPE, "application/graphql")
            .body(Self::query(scope))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DirectoryError::Status { status, body });
        }

        let body = response.bytes().await?;
        let users = parse_users(&body)?;
        log::info!("directory returned {} active users for {}", users.len(), scope);
        Ok(users)
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<UsersData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UsersData {
    #[serde(default)]
    users: Vec<DirectoryUser>,
}

#[derive(Debug, Deserialize)]
struct DirectoryUser {
    ned_id: Option<String>,
    inactive: Option<bool>,
    email: Option<String>,
    sac: Option<String>,
    status: Option<String>,
    division: Option<String>,
    building: Option<String>,
}

impl DirectoryUser {
    /// Inactive users and users without an email or id are not candidates.
    fn into_record(self) -> Option<UserRecord> {
        if self.inactive.unwrap_or(false) {
            return None;
        }
        let email = self.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty())?;
        let id = self.ned_id.filter(|id| !id.trim().is_empty())?;
        Some(UserRecord {
            id,
            email,
            status: non_blank(self.status),
            division: non_blank(self.division),
            building: non_blank(self.building),
            category: non_blank(self.sac),
        })
    }
}

/// Blank categorical values carry no answer and compare equal to a missing one.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_users(body: &[u8]) -> Result<Vec<UserRecord>, DirectoryError> {
    let parsed: GraphQlResponse = serde_json::from_slice(body)?;

    if !parsed.errors.is_empty() {
        let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
        return Err(DirectoryError::Query(messages.join("; ")));
    }

    let data = parsed
        .data
        .ok_or_else(|| DirectoryError::Query("response carried no data".to_string()))?;

    let records = data
        .users
        .into_iter()
        .filter_map(DirectoryUser::into_record)
        .collect();

    Ok(normalize_users(records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_users_filters_and_sorts() {
        let body = br#"{"data":{"users":[
            {"ned_id":"2","inactive":false,"email":"b@x.gov","sac":"HNC","status":"FED","division":"IT","building":"BG 31"},
            {"ned_id":"1","inactive":false,"email":"a@x.gov","sac":null,"status":"FED","division":null,"building":null},
            {"ned_id":"3","inactive":true,"email":"c@x.gov"},
            {"ned_id":"4","inactive":false,"email":"  "}
        ]}}"#;

        let users = parse_users(body).unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].email, "a@x.gov");
        assert_eq!(users[1].category.as_deref(), Some("HNC"));
    }

    #[test]
    fn test_blank_categorical_values_become_none() {
        let body = br#"{"data":{"users":[
            {"ned_id":"1","inactive":false,"email":"a@x.gov","sac":"","status":"  ","division":"IT","building":""}
        ]}}"#;
        let users = parse_users(body).unwrap();
        assert_eq!(users, vec![UserRecord::new("1", "a@x.gov").with_division("IT")]);
    }

    #[test]
    fn test_parse_users_surfaces_errors() {
        let body = br#"{"data":null,"errors":[{"message":"unauthorized"}]}"#;
        assert!(matches!(parse_users(body), Err(DirectoryError::Query(msg)) if msg == "unauthorized"));
    }

    #[test]
    fn test_query_embeds_scope() {
        assert_eq!(
            UserInfoClient::query("NCI"),
            "{ users(ic: \"NCI\") { ned_id, inactive, email, sac, status, division, building } }"
        );
    }
}
