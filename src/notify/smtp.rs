use super::{LogReportSink, NotifyError, ReportSink};
use crate::config::{MailConfig, ReportConfig};
use crate::reconcile::RunReport;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

/// Mails the rendered report to the configured recipients over SMTP.
///
/// The report is always logged first; with no recipients nothing is sent.
pub struct SmtpReportSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject: String,
}

impl SmtpReportSink {
    /// Builds the transport and parses every address up front. No connection is opened.
    pub fn new(mail: &MailConfig, report: &ReportConfig) -> Result<Self, NotifyError> {
        let from = mail.from.parse::<Mailbox>()?;
        let recipients = report
            .recipients
            .iter()
            .map(|address| address.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transport: transport(mail)?,
            from,
            recipients,
            subject: report.subject(),
        })
    }

    fn message(&self, report: &RunReport) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .reply_to(self.from.clone())
            .subject(format!("{}{}", self.subject, report.subject_suffix()))
            .header(ContentType::TEXT_HTML);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        Ok(builder.body(report.render_html())?)
    }
}

fn transport(mail: &MailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
    let mut builder = if mail.secure {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&mail.host)?
    } else if mail.ignore_tls {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&mail.host)
    } else {
        let tls = TlsParameters::new(mail.host.clone())?;
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&mail.host)
            .tls(Tls::Opportunistic(tls))
    };
    builder = builder.port(mail.port).timeout(Some(Duration::from_secs(30)));
    if let (Some(user), Some(password)) = (&mail.user, &mail.password) {
        builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
    }
    Ok(builder.build())
}

#[async_trait]
impl ReportSink for SmtpReportSink {
    async fn flush(&self, report: &RunReport) -> Result<(), NotifyError> {
        LogReportSink.flush(report).await?;

        if self.recipients.is_empty() {
            log::warn!("no report recipients configured, report for run {} only logged", report.run_id);
            return Ok(());
        }

        let message = self.message(report)?;
        self.transport.send(message).await?;

        log::info!(
            "report for run {} mailed to {} recipients",
            report.run_id,
            self.recipients.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::RunOperation;

    fn mail() -> MailConfig {
        MailConfig {
            host: "localhost".into(),
            port: 2525,
            secure: false,
            ignore_tls: true,
            from: "sync-bot@x.gov".into(),
            user: None,
            password: None,
        }
    }

    fn report_config(recipients: &[&str]) -> ReportConfig {
        ReportConfig {
            mail: Some(mail()),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            subject_prefix: "[TEST] ".into(),
        }
    }

    #[tokio::test]
    async fn test_message_headers_and_envelope() {
        let sink = SmtpReportSink::new(&mail(), &report_config(&["ops@x.gov", "lead@x.gov"])).unwrap();
        let mut report = RunReport::new(RunOperation::Reconcile);
        report.abort(&crate::error::SyncError::ThrottleClosed);

        let message = sink.message(&report).unwrap();
        let recipients: Vec<String> = message
            .envelope()
            .to()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(recipients, vec!["ops@x.gov", "lead@x.gov"]);
        assert_eq!(message.envelope().from().map(ToString::to_string).as_deref(), Some("sync-bot@x.gov"));

        let formatted = String::from_utf8(message.formatted()).unwrap();
        assert!(formatted.contains("Subject: [TEST] GovDelivery Update Report (ABORTED)"));
        assert!(formatted.contains("Reply-To: sync-bot@x.gov"));
        assert!(formatted.contains("Content-Type: text/html; charset=utf-8"));
    }

    #[test]
    fn test_bad_recipient_is_rejected_at_build() {
        let result = SmtpReportSink::new(&mail(), &report_config(&["not an address"]));
        assert!(matches!(result, Err(NotifyError::Address(_))));
    }

    #[tokio::test]
    async fn test_flush_without_recipients_only_logs() {
        let sink = SmtpReportSink::new(&mail(), &report_config(&[])).unwrap();
        let report = RunReport::new(RunOperation::ReloadCache);
        assert!(sink.flush(&report).await.is_ok());
    }
}
