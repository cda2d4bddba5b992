//! Run report: the single record of what one run did.
//!
//! Built incrementally by the orchestrator and flushed to a report sink on
//! every exit path.

use super::validate::EntryRejection;
use crate::error::SyncError;
use crate::remote::{GD_OPTED_OUT, GD_SUBSCRIBER_NOT_FOUND, RemoteError};
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use serde::Serialize;
use std::fmt::{self, Write};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    Reconcile,
    RemoveAll,
    ReloadCache,
}

impl fmt::Display for RunOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunOperation::Reconcile => "subscriber update",
            RunOperation::RemoveAll => "subscriber removal",
            RunOperation::ReloadCache => "local subscriber reload",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordAction {
    Add,
    Update,
    Remove,
}

/// What happened to one record in an apply phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Applied { detail: String },
    OptedOut,
    NotFound,
    Failed { error: String },
    /// Queued behind a fatal error and never started.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    pub email: String,
    pub action: RecordAction,
    pub outcome: Outcome,
}

impl RecordOutcome {
    pub fn applied(email: &str, action: RecordAction, detail: impl Into<String>) -> Self {
        Self {
            email: email.to_string(),
            action,
            outcome: Outcome::Applied {
                detail: detail.into(),
            },
        }
    }

    /// Map a per-record error onto the matching outcome.
    pub fn from_error(email: &str, action: RecordAction, err: &SyncError) -> Self {
        let outcome = match err {
            SyncError::Remote {
                source: RemoteError::OptedOut(_),
                ..
            } => Outcome::OptedOut,
            SyncError::Remote {
                source: RemoteError::SubscriberNotFound(_),
                ..
            } => Outcome::NotFound,
            other => Outcome::Failed {
                error: other.to_string(),
            },
        };
        Self {
            email: email.to_string(),
            action,
            outcome,
        }
    }

    pub fn skipped(email: &str, action: RecordAction) -> Self {
        Self {
            email: email.to_string(),
            action,
            outcome: Outcome::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlannedCounts {
    pub to_add: usize,
    pub to_update: usize,
    pub to_remove: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: RunOperation,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub planned: PlannedCounts,
    pub outcomes: Vec<RecordOutcome>,
    pub rejections: Vec<EntryRejection>,
    pub notes: Vec<String>,
    pub abort_reason: Option<String>,
}

impl RunReport {
    pub fn new(operation: RunOperation) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            operation,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            planned: PlannedCounts::default(),
            outcomes: Vec::new(),
            rejections: Vec::new(),
            notes: Vec::new(),
            abort_reason: None,
        }
    }

    pub fn note(&mut self, line: impl Into<String>) {
        self.notes.push(line.into());
    }

    pub fn record(&mut self, outcome: RecordOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn reject(&mut self, rejection: EntryRejection) {
        self.rejections.push(rejection);
    }

    pub fn succeed(&mut self) {
        self.status = RunStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    pub fn abort(&mut self, reason: &SyncError) {
        self.status = RunStatus::Aborted;
        self.abort_reason = Some(reason.to_string());
        self.completed_at = Some(Utc::now());
    }

    pub fn is_aborted(&self) -> bool {
        self.status == RunStatus::Aborted
    }

    fn outcomes_where<'a>(
        &'a self,
        predicate: impl Fn(&RecordOutcome) -> bool + 'a,
    ) -> impl Iterator<Item = &'a RecordOutcome> + 'a {
        self.outcomes.iter().filter(move |o| predicate(o))
    }

    /// Outcomes of one action that reached the remote system.
    pub fn applied(&self, action: RecordAction) -> Vec<&RecordOutcome> {
        self.outcomes_where(move |o| {
            o.action == action && matches!(o.outcome, Outcome::Applied { .. })
        })
        .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.outcome)).count()
    }

    pub fn subject_suffix(&self) -> &'static str {
        match self.status {
            RunStatus::Aborted => " (ABORTED)",
            _ => "",
        }
    }

    /// HTML body of the notification mail.
    pub fn render_html(&self) -> String {
        let mut html = String::new();
        let _ = write!(
            html,
            "Starting {} on {}<br/>",
            self.operation,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = write!(html, "Run id {}<br/>", self.run_id);

        if self.operation == RunOperation::Reconcile {
            let _ = write!(html, "{} users to add.<br/>", self.planned.to_add);
            let _ = write!(html, "{} users to update.<br/>", self.planned.to_update);
            let _ = write!(html, "{} users to remove.<br/>", self.planned.to_remove);
        }

        for note in &self.notes {
            let _ = write!(html, "{}<br/>", escape(note.as_str()));
        }

        let sections = [
            (RecordAction::Remove, "Removing the following subscribers:"),
            (RecordAction::Update, "Updating the following subscribers:"),
            (RecordAction::Add, "Adding the following subscribers:"),
        ];
        for (action, title) in sections {
            let applied = self.applied(action);
            if applied.is_empty() {
                continue;
            }
            let _ = write!(html, "<p><strong>{title}</strong></p>");
            for outcome in applied {
                let _ = write!(html, "{}<br/>", escape(outcome.email.as_str()));
            }
        }

        self.render_list(
            &mut html,
            &format!(
                "Failed due to error {GD_OPTED_OUT} (This destination has requested to no longer receive emails):"
            ),
            self.outcomes_where(|o| o.outcome == Outcome::OptedOut)
                .map(|o| o.email.clone())
                .collect(),
        );
        self.render_list(
            &mut html,
            &format!("Failed due to error {GD_SUBSCRIBER_NOT_FOUND} (Subscriber not found):"),
            self.outcomes_where(|o| o.outcome == Outcome::NotFound)
                .map(|o| o.email.clone())
                .collect(),
        );
        self.render_list(
            &mut html,
            "Invalid entries (not sent to GovDelivery):",
            self.rejections.iter().map(|r| r.to_string()).collect(),
        );
        self.render_list(
            &mut html,
            "Failures:",
            self.outcomes
                .iter()
                .filter_map(|o| match &o.outcome {
                    Outcome::Failed { error } => Some(format!("{}: {}", o.email, error)),
                    _ => None,
                })
                .collect(),
        );

        let skipped = self.count(|o| *o == Outcome::Skipped);
        if skipped > 0 {
            let _ = write!(html, "<p>{skipped} queued records were not processed.</p>");
        }

        if let Some(reason) = &self.abort_reason {
            let _ = write!(
                html,
                "<p><strong>Run aborted:</strong> {}</p>",
                escape(reason.as_str())
            );
        }

        html
    }

    fn render_list(&self, html: &mut String, title: &str, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let _ = write!(html, "<p><strong>{title}</strong></p>");
        for line in lines {
            let _ = write!(html, "{}<br/>", escape(line.as_str()));
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "run {} {:?}: {} removed, {} updated, {} added, {} opted out, {} not found, {} invalid, {} failed",
            self.run_id,
            self.status,
            self.applied(RecordAction::Remove).len(),
            self.applied(RecordAction::Update).len(),
            self.applied(RecordAction::Add).len(),
            self.count(|o| *o == Outcome::OptedOut),
            self.count(|o| *o == Outcome::NotFound),
            self.rejections.len(),
            self.count(|o| matches!(o, Outcome::Failed { .. })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CategoricalField;

    #[test]
    fn test_render_groups_outcomes() {
        let mut report = RunReport::new(RunOperation::Reconcile);
        report.planned = PlannedCounts {
            to_add: 2,
            to_update: 0,
            to_remove: 1,
        };
        report.record(RecordOutcome::applied("b@x.gov", RecordAction::Remove, "deleted"));
        report.record(RecordOutcome::applied("a@x.gov", RecordAction::Add, "created"));
        report.record(RecordOutcome::from_error(
            "c@x.gov",
            RecordAction::Add,
            &SyncError::remote("c@x.gov", RemoteError::OptedOut(GD_OPTED_OUT.into())),
        ));
        report.reject(EntryRejection {
            email: "d@x.gov".into(),
            field: CategoricalField::Building,
            value: "BG <9>".into(),
        });
        report.succeed();

        let html = report.render_html();
        assert!(html.contains("2 users to add.<br/>"));
        assert!(html.contains("<p><strong>Removing the following subscribers:</strong></p>b@x.gov<br/>"));
        assert!(html.contains("<p><strong>Adding the following subscribers:</strong></p>a@x.gov<br/>"));
        assert!(html.contains("GD-15004"));
        assert!(html.contains("c@x.gov<br/>"));
        assert!(html.contains("BG &lt;9&gt;"));
        assert!(!html.contains("Updating the following"));
        assert!(!html.contains("Run aborted"));
    }

    #[test]
    fn test_abort_reason_is_rendered() {
        let mut report = RunReport::new(RunOperation::Reconcile);
        report.abort(&SyncError::TooManyRemovals {
            count: 250,
            limit: 199,
        });

        assert!(report.is_aborted());
        assert_eq!(report.subject_suffix(), " (ABORTED)");
        assert!(
            report
                .render_html()
                .contains("too many removals, manual verification required")
        );
    }

    #[test]
    fn test_summary_counts() {
        let mut report = RunReport::new(RunOperation::RemoveAll);
        report.record(RecordOutcome::applied("a@x.gov", RecordAction::Remove, "deleted"));
        report.record(RecordOutcome::skipped("b@x.gov", RecordAction::Remove));
        report.record(RecordOutcome::from_error(
            "c@x.gov",
            RecordAction::Remove,
            &SyncError::Task("boom".into()),
        ));

        let summary = report.summary();
        assert!(summary.contains("1 removed"));
        assert!(summary.contains("1 failed"));
    }
}
