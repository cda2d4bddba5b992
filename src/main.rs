use clap::{Parser, Subcommand};
use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;
use subscriber_sync::config::{AnswerTables, OnInvalidEntry, SyncConfig};
use subscriber_sync::directory::UserInfoClient;
use subscriber_sync::init_logger;
use subscriber_sync::notify::{LogReportSink, ReportSink, SmtpReportSink};
use subscriber_sync::reconcile::{Collaborators, SyncOrchestrator};
use subscriber_sync::remote::GovDeliveryClient;
use subscriber_sync::store::PgSubscriberStore;

#[derive(Parser, Debug)]
#[command(
    name = "subscriber-sync",
    about = "Keep a GovDelivery topic in line with the staff directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Upper bound on record operations in flight at once.
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Abort when more removals than this are scheduled.
    #[arg(long, global = true)]
    max_removals: Option<usize>,

    /// What to do when a record has no configured answer.
    #[arg(long, global = true, value_enum)]
    on_invalid_entry: Option<OnInvalidEntry>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Diff the directory against the cache and apply the changes.
    Reconcile,
    /// Remove every cached subscriber from the managed topic.
    RemoveAll,
    /// Rebuild the cache from the directory without touching GovDelivery.
    ReloadCache,
}

fn build(cli: &Cli) -> Result<SyncOrchestrator, Box<dyn Error>> {
    let mut config = SyncConfig::from_env()?;
    if let Some(max) = cli.max_concurrent {
        config.run.max_concurrent = max.max(1);
    }
    if let Some(max) = cli.max_removals {
        config.run.max_removals = max;
    }
    if let Some(policy) = cli.on_invalid_entry {
        config.run.on_invalid_entry = policy;
    }

    let answers = AnswerTables::load(&config.answer_tables_path)?;
    log::info!(
        "loaded answer tables from {}",
        config.answer_tables_path.display()
    );

    let collaborators = Collaborators {
        directory: Arc::new(UserInfoClient::new(config.directory.clone())?),
        store: Arc::new(PgSubscriberStore::connect_lazy(&config.database_url)?),
        api: Arc::new(GovDeliveryClient::new(config.remote.clone())?),
        sink: report_sink(&config)?,
    };

    Ok(SyncOrchestrator::new(collaborators, answers, config.run))
}

fn report_sink(config: &SyncConfig) -> Result<Arc<dyn ReportSink>, Box<dyn Error>> {
    match &config.report.mail {
        Some(mail) => {
            log::info!("reports will be mailed through {}:{}", mail.host, mail.port);
            Ok(Arc::new(SmtpReportSink::new(mail, &config.report)?))
        }
        None => {
            log::warn!("MAIL_HOST not set, reports only go to the log");
            Ok(Arc::new(LogReportSink))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse();

    let orchestrator = match build(&cli) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            log::error!("configuration error: {}", err);
            return ExitCode::from(2);
        }
    };

    let settings = orchestrator.settings();
    log::info!(
        "running {:?} on topic {} (max {} concurrent, max {} removals, invalid entries: {})",
        cli.command,
        settings.managed_topic,
        settings.max_concurrent,
        settings.max_removals,
        settings.on_invalid_entry
    );

    let result = match cli.command {
        Command::Reconcile => orchestrator.reconcile().await,
        Command::RemoveAll => orchestrator.remove_all().await,
        Command::ReloadCache => orchestrator.reload_cache().await,
    };

    match result {
        Ok(report) => {
            log::info!("finished: {}", report.summary());
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("run failed: {}", err);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_invalid_entry_flag_is_a_value_enum() {
        let cli = Cli::try_parse_from(["subscriber-sync", "reconcile", "--on-invalid-entry", "abort"]).unwrap();
        assert_eq!(cli.on_invalid_entry, Some(OnInvalidEntry::Abort));

        let cli = Cli::try_parse_from(["subscriber-sync", "remove-all"]).unwrap();
        assert_eq!(cli.on_invalid_entry, None);

        assert!(Cli::try_parse_from(["subscriber-sync", "reconcile", "--on-invalid-entry", "exit"]).is_err());
    }
}
