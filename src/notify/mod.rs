//! Where finished run reports go.

pub mod smtp;

pub use smtp::SmtpReportSink;

use crate::reconcile::RunReport;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mail address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build report mail: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("report rejected: {0}")]
    Rejected(String),
}

/// Receives the report once per run, on every exit path.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn flush(&self, report: &RunReport) -> Result<(), NotifyError>;
}

/// Writes the report summary and body to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReportSink;

#[async_trait]
impl ReportSink for LogReportSink {
    async fn flush(&self, report: &RunReport) -> Result<(), NotifyError> {
        if report.is_aborted() {
            log::error!("{}", report.summary());
        } else {
            log::info!("{}", report.summary());
        }
        log::debug!("report body: {}", report.render_html());
        Ok(())
    }
}
