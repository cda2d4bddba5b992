use crate::models::{CategoricalField, QuestionResponse, UserRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use clap::ValueEnum;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key} has an invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
    #[error("failed to read answer tables from {path}: {source}")]
    AnswerTablesIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse answer tables from {path}: {source}")]
    AnswerTablesParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// What to do with a record whose categorical fields have no configured answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OnInvalidEntry {
    /// Exclude the record from remote application and note it in the report.
    #[default]
    Skip,
    /// Abort the whole run before any mutation.
    Abort,
}

impl fmt::Display for OnInvalidEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OnInvalidEntry::Skip => "skip",
            OnInvalidEntry::Abort => "abort",
        })
    }
}

/// Question ids on the remote side, one per categorical field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionIds {
    pub status: String,
    pub division: String,
    pub building: String,
    #[serde(alias = "sac")]
    pub category: String,
}

/// Read-only lookup tables mapping categorical values to remote answer ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerTables {
    pub questions: QuestionIds,
    #[serde(default, alias = "status_answers")]
    pub status: HashMap<String, String>,
    #[serde(default, alias = "division_answers")]
    pub division: HashMap<String, String>,
    #[serde(default, alias = "building_answers")]
    pub building: HashMap<String, String>,
    #[serde(default, alias = "sac", alias = "sac_answers")]
    pub category: HashMap<String, String>,
}

impl AnswerTables {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::AnswerTablesIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::AnswerTablesParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn table(&self, field: CategoricalField) -> &HashMap<String, String> {
        match field {
            CategoricalField::Status => &self.status,
            CategoricalField::Division => &self.division,
            CategoricalField::Building => &self.building,
            CategoricalField::Category => &self.category,
        }
    }

    fn question(&self, field: CategoricalField) -> &str {
        match field {
            CategoricalField::Status => &self.questions.status,
            CategoricalField::Division => &self.questions.division,
            CategoricalField::Building => &self.questions.building,
            CategoricalField::Category => &self.questions.category,
        }
    }

    pub fn answer(&self, field: CategoricalField, value: &str) -> Option<&str> {
        self.table(field).get(value).map(String::as_str)
    }

    /// Question responses for every populated field that has an answer.
    pub fn responses_for(&self, record: &UserRecord) -> Vec<QuestionResponse> {
        record
            .categorical_fields()
            .filter_map(|(field, value)| {
                self.answer(field, value).map(|answer| QuestionResponse {
                    question_id: self.question(field).to_string(),
                    answer_id: answer.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub graphql_url: String,
    pub user: String,
    pub password: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub account_code: String,
    pub user: String,
    pub password: String,
    pub topic_code: String,
    pub request_timeout: Duration,
}

/// SMTP transport settings for the report mail.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS from the first byte (usually port 465).
    pub secure: bool,
    /// Plain connection, no STARTTLS attempt.
    pub ignore_tls: bool,
    pub from: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    /// Unset means reports only go to the log.
    pub mail: Option<MailConfig>,
    pub recipients: Vec<String>,
    pub subject_prefix: String,
}

impl ReportConfig {
    pub fn subject(&self) -> String {
        format!("{}GovDelivery Update Report", self.subject_prefix)
    }
}

impl MailConfig {
    /// `None` when `MAIL_HOST` is unset.
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(host) = env_optional("MAIL_HOST") else {
            return Ok(None);
        };
        let port = match env::var("MAIL_PORT") {
            Ok(value) => value.trim().parse::<u16>().map_err(|_| ConfigError::Invalid {
                key: "MAIL_PORT",
                value,
            })?,
            Err(_) => 25,
        };
        Ok(Some(Self {
            host,
            port,
            secure: env_bool("MAIL_SECURE", false),
            ignore_tls: env_bool("MAIL_IGNORE_TLS", false),
            from: env_required("MAIL_FROM")?,
            user: env_optional("MAIL_USER"),
            password: env_optional("MAIL_PASSWORD"),
        }))
    }
}

/// Tunables for a single reconciliation run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_concurrent: usize,
    pub max_removals: usize,
    pub on_invalid_entry: OnInvalidEntry,
    pub managed_topic: String,
    /// Organisational scope passed to the directory.
    pub scope: String,
}

impl RunSettings {
    pub fn new(managed_topic: impl Into<String>) -> Self {
        Self {
            max_concurrent: 100,
            max_removals: 199,
            on_invalid_entry: OnInvalidEntry::Skip,
            managed_topic: managed_topic.into(),
            scope: "NCI".to_string(),
        }
    }
}

/// Full job configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub directory: DirectoryConfig,
    pub remote: RemoteConfig,
    pub report: ReportConfig,
    pub run: RunSettings,
    pub answer_tables_path: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let on_invalid_entry = match env::var("SYNC_ON_INVALID_ENTRY") {
            Ok(value) => {
                OnInvalidEntry::from_str(value.trim(), true).map_err(|_| ConfigError::Invalid {
                    key: "SYNC_ON_INVALID_ENTRY",
                    value: value.clone(),
                })?
            }
            Err(_) => OnInvalidEntry::default(),
        };

        let topic_code = env_required("GOVDELIVERY_TOPIC_CODE")?;

        let run = RunSettings {
            max_concurrent: env_usize("SYNC_MAX_CONCURRENT", 100).max(1),
            max_removals: env_usize("SYNC_MAX_REMOVALS", 199),
            on_invalid_entry,
            managed_topic: topic_code.clone(),
            scope: env_string("USERINFO_SCOPE", "NCI"),
        };

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            directory: DirectoryConfig {
                graphql_url: env_required("USERINFO_GRAPHQL_URL")?,
                user: env_required("USERINFO_USER")?,
                password: env_required("USERINFO_PASSWORD")?,
                request_timeout: env_duration_millis("USERINFO_TIMEOUT_MS", 15 * 60 * 1000),
            },
            remote: RemoteConfig {
                base_url: env_string(
                    "GOVDELIVERY_BASE_URL",
                    "https://api.govdelivery.com/api/account",
                ),
                account_code: env_required("GOVDELIVERY_ACCOUNT_CODE")?,
                user: env_required("GOVDELIVERY_USER")?,
                password: env_required("GOVDELIVERY_PASSWORD")?,
                topic_code,
                request_timeout: env_duration_millis("GOVDELIVERY_TIMEOUT_MS", 60_000),
            },
            report: ReportConfig {
                mail: MailConfig::from_env()?,
                recipients: env_list("REPORT_RECIPIENTS"),
                subject_prefix: env_string("REPORT_SUBJECT_PREFIX", ""),
            },
            run,
            answer_tables_path: PathBuf::from(env_string(
                "SYNC_ANSWER_TABLES_PATH",
                "./answers.json",
            )),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> AnswerTables {
        serde_json::from_str(
            r#"{
                "questions": {"status": "q1", "division": "q2", "building": "q3", "sac": "q4"},
                "status_answers": {"FED": "a1"},
                "division": {"IT": "a2"},
                "building": {"BG 31": "a3"},
                "sac": {"HNC": "a4"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_on_invalid_entry_parse() {
        assert_eq!(OnInvalidEntry::from_str("skip", true), Ok(OnInvalidEntry::Skip));
        assert_eq!(OnInvalidEntry::from_str("ABORT", true), Ok(OnInvalidEntry::Abort));
        assert!(OnInvalidEntry::from_str("exit", true).is_err());
    }

    #[test]
    fn test_answer_tables_accept_legacy_keys() {
        let tables = tables();
        assert_eq!(tables.questions.category, "q4");
        assert_eq!(tables.answer(CategoricalField::Status, "FED"), Some("a1"));
        assert_eq!(tables.answer(CategoricalField::Category, "HNC"), Some("a4"));
        assert_eq!(tables.answer(CategoricalField::Division, "HR"), None);
    }

    #[test]
    fn test_example_answer_file_loads() {
        let tables = AnswerTables::load(Path::new("answers.example.json")).unwrap();
        assert_eq!(tables.questions.category, "Q_SAC");
        assert_eq!(tables.answer(CategoricalField::Building, "BG 31"), Some("A_BLDG_31"));

        let missing = AnswerTables::load(Path::new("does-not-exist.json"));
        assert!(matches!(missing, Err(ConfigError::AnswerTablesIo { .. })));
    }

    #[test]
    fn test_responses_for_uses_category_table() {
        let record = UserRecord::new("1", "a@x.gov")
            .with_status("FED")
            .with_category("HNC");
        let responses = tables().responses_for(&record);
        assert_eq!(
            responses,
            vec![
                QuestionResponse {
                    question_id: "q1".to_string(),
                    answer_id: "a1".to_string()
                },
                QuestionResponse {
                    question_id: "q4".to_string(),
                    answer_id: "a4".to_string()
                },
            ]
        );
    }
}
