use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeSet;

// ===== Directory / Cache Models =====

/// One directory-sourced subscriber candidate.
///
/// `id` is the stable directory identifier and the cache primary key. `email`
/// is the reconciliation sort key; the categorical fields select the answers
/// submitted to the remote question set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub status: Option<String>,
    pub division: Option<String>,
    pub building: Option<String>,
    #[serde(alias = "sac")]
    pub category: Option<String>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            status: None,
            division: None,
            building: None,
            category: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_division(mut self, division: impl Into<String>) -> Self {
        self.division = Some(division.into());
        self
    }

    pub fn with_building(mut self, building: impl Into<String>) -> Self {
        self.building = Some(building.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// True when any categorical field differs from `other`.
    ///
    /// Email and id are identity, not content, and are ignored here.
    pub fn attributes_differ(&self, other: &UserRecord) -> bool {
        self.status != other.status
            || self.division != other.division
            || self.building != other.building
            || self.category != other.category
    }

    /// Populated categorical fields as `(field, value)` pairs.
    pub fn categorical_fields(&self) -> impl Iterator<Item = (CategoricalField, &str)> {
        [
            (CategoricalField::Status, self.status.as_deref()),
            (CategoricalField::Division, self.division.as_deref()),
            (CategoricalField::Building, self.building.as_deref()),
            (CategoricalField::Category, self.category.as_deref()),
        ]
        .into_iter()
        .filter_map(|(field, value)| value.map(|v| (field, v)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalField {
    Status,
    Division,
    Building,
    Category,
}

impl CategoricalField {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoricalField::Status => "status",
            CategoricalField::Division => "division",
            CategoricalField::Building => "building",
            CategoricalField::Category => "category",
        }
    }
}

impl std::fmt::Display for CategoricalField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===== Reconciliation Models =====

/// Output of one comparison pass.
///
/// `to_add` and `to_update` hold directory records; `to_remove` holds the
/// previously cached record since the directory no longer has it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub to_add: Vec<UserRecord>,
    pub to_update: Vec<UserRecord>,
    pub to_remove: Vec<UserRecord>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

// ===== Remote Models =====

/// Result of a remote subscriber read; absence is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberLookup {
    Found(RemoteSubscriber),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscriber {
    pub email: String,
}

/// Remote subscription state of one subscriber, fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteSubscriptionState {
    Missing,
    Present { topics: BTreeSet<String> },
}

/// A single question/answer pair submitted for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub question_id: String,
    pub answer_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributes_differ_ignores_identity() {
        let a = UserRecord::new("1", "a@x.gov").with_status("FED");
        let mut b = UserRecord::new("2", "a@x.gov").with_status("FED");
        assert!(!a.attributes_differ(&b));

        b.building = Some("BG 31".to_string());
        assert!(a.attributes_differ(&b));
    }

    #[test]
    fn test_categorical_fields_skip_unpopulated() {
        let record = UserRecord::new("1", "a@x.gov")
            .with_status("FED")
            .with_category("HNC");
        let fields: Vec<_> = record.categorical_fields().collect();
        assert_eq!(
            fields,
            vec![
                (CategoricalField::Status, "FED"),
                (CategoricalField::Category, "HNC")
            ]
        );
    }

    #[test]
    fn test_category_accepts_sac_alias() {
        let record: UserRecord =
            serde_json::from_str(r#"{"id":"9","email":"z@x.gov","sac":"HNC"}"#).unwrap();
        assert_eq!(record.category.as_deref(), Some("HNC"));
    }
}
