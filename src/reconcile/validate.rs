//! Categorical field validation against the configured answer tables.

use crate::config::AnswerTables;
use crate::error::SyncError;
use crate::models::{CategoricalField, UserRecord};
use serde::Serialize;
use std::fmt;

/// Why a record was kept away from the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRejection {
    pub email: String,
    pub field: CategoricalField,
    pub value: String,
}

impl fmt::Display for EntryRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: no configured answer for {} '{}'",
            self.email, self.field, self.value
        )
    }
}

impl From<EntryRejection> for SyncError {
    fn from(rejection: EntryRejection) -> Self {
        SyncError::InvalidEntry {
            email: rejection.email,
            field: rejection.field,
            value: rejection.value,
        }
    }
}

pub struct EntryValidator<'a> {
    tables: &'a AnswerTables,
}

impl<'a> EntryValidator<'a> {
    pub fn new(tables: &'a AnswerTables) -> Self {
        Self { tables }
    }

    /// Check every populated categorical field; the first miss is reported.
    pub fn validate(&self, record: &UserRecord) -> Result<(), EntryRejection> {
        for (field, value) in record.categorical_fields() {
            if self.tables.answer(field, value).is_none() {
                return Err(EntryRejection {
                    email: record.email.clone(),
                    field,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn is_valid(&self, record: &UserRecord) -> bool {
        self.validate(record).is_ok()
    }

    /// Split records into valid ones and rejections, preserving input order.
    pub fn partition(&self, records: Vec<UserRecord>) -> (Vec<UserRecord>, Vec<EntryRejection>) {
        let mut valid = Vec::with_capacity(records.len());
        let mut rejected = Vec::new();
        for record in records {
            match self.validate(&record) {
                Ok(()) => valid.push(record),
                Err(rejection) => rejected.push(rejection),
            }
        }
        (valid, rejected)
    }
}
