//! Drives one run end to end.
//!
//! Reconcile phases run in a fixed order: fetch, diff, guardrail, validate,
//! then removals, updates and additions. Each record is applied by its own
//! task holding a shared throttle slot; the remote call goes first and the
//! cache write only follows a successful remote call. The first fatal error
//! stops new records from starting, lets in-flight ones finish, and ends the
//! run. The store is released and the report flushed on every path.

use super::compare;
use super::report::{PlannedCounts, RecordAction, RecordOutcome, RunOperation, RunReport};
use super::resolver::SubscriptionResolver;
use super::throttle::Throttle;
use super::validate::EntryValidator;
use crate::config::{AnswerTables, OnInvalidEntry, RunSettings};
use crate::directory::DirectorySource;
use crate::error::{SyncError, SyncResult};
use crate::models::UserRecord;
use crate::notify::ReportSink;
use crate::remote::SubscriptionApi;
use crate::store::SubscriberStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinSet;

/// External systems a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectorySource>,
    pub store: Arc<dyn SubscriberStore>,
    pub api: Arc<dyn SubscriptionApi>,
    pub sink: Arc<dyn ReportSink>,
}

/// Applies one record's remote mutation, then mirrors it into the cache.
#[derive(Clone)]
struct RecordApplier {
    store: Arc<dyn SubscriberStore>,
    resolver: SubscriptionResolver,
    answers: Arc<AnswerTables>,
}

impl RecordApplier {
    async fn apply(&self, action: RecordAction, record: &UserRecord) -> SyncResult<String> {
        match action {
            RecordAction::Remove => {
                let plan = self.resolver.remove(&record.email).await?;
                self.store.delete_by_id(&record.id).await?;
                Ok(plan.to_string())
            }
            RecordAction::Update => {
                self.resolver
                    .refresh_responses(record, &self.answers)
                    .await?;
                self.store.upsert(record).await?;
                Ok("responses updated".to_string())
            }
            RecordAction::Add => {
                let plan = self.resolver.add(record, &self.answers).await?;
                self.store.upsert(record).await?;
                Ok(plan.to_string())
            }
        }
    }
}

/// Per-run state: the report being built, the throttle and the abort flag.
struct RunContext {
    report: RunReport,
    throttle: Throttle,
    aborted: Arc<AtomicBool>,
}

impl RunContext {
    fn new(operation: RunOperation, settings: &RunSettings) -> Self {
        Self {
            report: RunReport::new(operation),
            throttle: Throttle::new(settings.max_concurrent),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }
}

pub struct SyncOrchestrator {
    directory: Arc<dyn DirectorySource>,
    store: Arc<dyn SubscriberStore>,
    sink: Arc<dyn ReportSink>,
    applier: RecordApplier,
    settings: RunSettings,
}

impl SyncOrchestrator {
    pub fn new(collaborators: Collaborators, answers: AnswerTables, settings: RunSettings) -> Self {
        let resolver = SubscriptionResolver::new(collaborators.api, settings.managed_topic.clone());
        Self {
            directory: collaborators.directory,
            store: collaborators.store.clone(),
            sink: collaborators.sink,
            applier: RecordApplier {
                store: collaborators.store,
                resolver,
                answers: Arc::new(answers),
            },
            settings,
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Bring the remote topic and the cache in line with the directory.
    pub async fn reconcile(&self) -> SyncResult<RunReport> {
        let mut ctx = RunContext::new(RunOperation::Reconcile, &self.settings);
        log::info!("run {}: starting {}", ctx.report.run_id, ctx.report.operation);
        let result = self.reconcile_phases(&mut ctx).await;
        self.finish(ctx, result).await
    }

    /// Remove every cached subscriber from the managed topic.
    pub async fn remove_all(&self) -> SyncResult<RunReport> {
        let mut ctx = RunContext::new(RunOperation::RemoveAll, &self.settings);
        log::info!("run {}: starting {}", ctx.report.run_id, ctx.report.operation);
        let result = self.remove_all_phases(&mut ctx).await;
        self.finish(ctx, result).await
    }

    /// Replace the cache with the directory's current records, with no remote calls.
    pub async fn reload_cache(&self) -> SyncResult<RunReport> {
        let mut ctx = RunContext::new(RunOperation::ReloadCache, &self.settings);
        log::info!("run {}: starting {}", ctx.report.run_id, ctx.report.operation);
        let result = self.reload_cache_phases(&mut ctx).await;
        self.finish(ctx, result).await
    }

    async fn reconcile_phases(&self, ctx: &mut RunContext) -> SyncResult<()> {
        self.store.acquire().await?;

        let current = self.directory.fetch_users(&self.settings.scope).await?;
        let cached = self.store.find_all().await?;
        log::info!(
            "run {}: {} directory users, {} cached subscribers",
            ctx.report.run_id,
            current.len(),
            cached.len()
        );

        let diff = compare::diff(&current, &cached)?;
        if diff.is_empty() {
            log::info!("run {}: directory and cache agree, nothing to apply", ctx.report.run_id);
        }
        ctx.report.planned = PlannedCounts {
            to_add: diff.to_add.len(),
            to_update: diff.to_update.len(),
            to_remove: diff.to_remove.len(),
        };
        log::info!(
            "run {}: {} to add, {} to update, {} to remove",
            ctx.report.run_id,
            diff.to_add.len(),
            diff.to_update.len(),
            diff.to_remove.len()
        );

        if diff.to_remove.len() > self.settings.max_removals {
            return Err(SyncError::TooManyRemovals {
                count: diff.to_remove.len(),
                limit: self.settings.max_removals,
            });
        }

        let validator = EntryValidator::new(&self.applier.answers);
        let (to_update, rejected_updates) = validator.partition(diff.to_update);
        let (to_add, rejected_additions) = validator.partition(diff.to_add);
        let rejected: Vec<_> = rejected_updates
            .into_iter()
            .chain(rejected_additions)
            .collect();
        for rejection in &rejected {
            log::warn!("invalid entry {}", rejection);
            ctx.report.reject(rejection.clone());
        }
        if self.settings.on_invalid_entry == OnInvalidEntry::Abort {
            if let Some(first) = rejected.into_iter().next() {
                return Err(first.into());
            }
        }

        self.apply_phase(ctx, RecordAction::Remove, diff.to_remove)
            .await?;
        self.apply_phase(ctx, RecordAction::Update, to_update).await?;
        self.apply_phase(ctx, RecordAction::Add, to_add).await?;

        self.quiesce(ctx).await
    }

    async fn remove_all_phases(&self, ctx: &mut RunContext) -> SyncResult<()> {
        self.store.acquire().await?;
        let cached = self.store.find_all().await?;
        ctx.report.planned.to_remove = cached.len();
        ctx.report
            .note(format!("{} cached subscribers to remove.", cached.len()));

        self.apply_phase(ctx, RecordAction::Remove, cached).await?;
        self.quiesce(ctx).await
    }

    async fn reload_cache_phases(&self, ctx: &mut RunContext) -> SyncResult<()> {
        self.store.acquire().await?;
        let users = self.directory.fetch_users(&self.settings.scope).await?;

        // Nothing else may touch the cache while it is rebuilt.
        let _exclusive = ctx.throttle.acquire_exclusive().await?;
        let removed = self.store.delete_all().await?;
        for user in &users {
            self.store.upsert(user).await?;
        }

        log::info!(
            "run {}: replaced {} cached rows with {} directory users",
            ctx.report.run_id,
            removed,
            users.len()
        );
        ctx.report.note(format!(
            "Replaced {} cached subscribers with {} directory users.",
            removed,
            users.len()
        ));
        Ok(())
    }

    /// Apply `action` to every record, at most `max_concurrent` at a time.
    async fn apply_phase(
        &self,
        ctx: &mut RunContext,
        action: RecordAction,
        records: Vec<UserRecord>,
    ) -> SyncResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        log::info!(
            "run {}: applying {:?} to {} records",
            ctx.report.run_id,
            action,
            records.len()
        );

        let mut tasks = JoinSet::new();
        for record in records {
            let applier = self.applier.clone();
            let throttle = ctx.throttle.clone();
            let aborted = ctx.aborted.clone();

            tasks.spawn(async move {
                let _permit = match throttle.acquire_shared().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        return (RecordOutcome::from_error(&record.email, action, &err), Some(err));
                    }
                };
                if aborted.load(Ordering::Acquire) {
                    return (RecordOutcome::skipped(&record.email, action), None);
                }

                match applier.apply(action, &record).await {
                    Ok(detail) => (RecordOutcome::applied(&record.email, action, detail), None),
                    Err(err) if err.is_soft() => {
                        log::warn!("skipping {}: {}", record.email, err);
                        (RecordOutcome::from_error(&record.email, action, &err), None)
                    }
                    Err(err) => {
                        aborted.store(true, Ordering::Release);
                        log::error!("{:?} failed for {}: {}", action, record.email, err);
                        (RecordOutcome::from_error(&record.email, action, &err), Some(err))
                    }
                }
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, err)) => {
                    ctx.report.record(outcome);
                    if let Some(err) = err {
                        fatal.get_or_insert(err);
                    }
                }
                Err(join_err) => {
                    ctx.aborted.store(true, Ordering::Release);
                    fatal.get_or_insert(SyncError::from(join_err));
                }
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until no record operation holds a slot.
    async fn quiesce(&self, ctx: &RunContext) -> SyncResult<()> {
        let _drained = ctx.throttle.acquire_exclusive().await?;
        log::debug!("run {}: all record operations drained", ctx.report.run_id);
        Ok(())
    }

    async fn finish(&self, mut ctx: RunContext, result: SyncResult<()>) -> SyncResult<RunReport> {
        self.store.release().await;
        ctx.throttle.close();

        match &result {
            Ok(()) => ctx.report.succeed(),
            Err(err) => {
                log::error!("run {} aborted: {}", ctx.report.run_id, err);
                ctx.report.abort(err);
            }
        }

        if let Err(err) = self.sink.flush(&ctx.report).await {
            log::error!("failed to deliver report for run {}: {}", ctx.report.run_id, err);
        }

        result.map(|()| ctx.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fakes::{
        CapturingSink, FakeDirectory, FakeSubscriptionApi, MemoryStore, StoreCall,
    };

    fn orchestrator(
        directory: Vec<UserRecord>,
        store: &Arc<MemoryStore>,
        api: &Arc<FakeSubscriptionApi>,
        sink: &Arc<CapturingSink>,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Collaborators {
                directory: Arc::new(FakeDirectory::new(directory)),
                store: store.clone(),
                api: api.clone(),
                sink: sink.clone(),
            },
            AnswerTables::default(),
            RunSettings::new("ALLSTAFF"),
        )
    }

    #[tokio::test]
    async fn test_remote_failure_leaves_cache_untouched() {
        let store = Arc::new(MemoryStore::with_records(vec![UserRecord::new("1", "a@x.gov")]));
        let api = Arc::new(FakeSubscriptionApi::new());
        api.insert_subscriber("a@x.gov", &["ALLSTAFF"]);
        api.fail_mutations_for("a@x.gov");
        let sink = Arc::new(CapturingSink::new());

        let err = orchestrator(Vec::new(), &store, &api, &sink)
            .reconcile()
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Remote { .. }));
        assert_eq!(store.emails(), vec!["a@x.gov".to_string()]);
        assert!(!store.calls().contains(&StoreCall::DeleteById("1".into())));
        assert_eq!(store.release_count(), 1);
        assert!(sink.last().unwrap().is_aborted());
    }

    #[tokio::test]
    async fn test_unsorted_directory_aborts_before_mutation() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FakeSubscriptionApi::new());
        let sink = Arc::new(CapturingSink::new());
        let directory = vec![UserRecord::new("2", "b@x.gov"), UserRecord::new("1", "a@x.gov")];

        let err = orchestrator(directory, &store, &api, &sink)
            .reconcile()
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::UnsortedInput { .. }));
        assert!(api.mutations().is_empty());
        assert!(store.records().is_empty());
    }
}
