//! In-memory stand-ins for the directory, cache store, remote service and
//! report sink. Every fake records the calls it receives so tests can assert
//! on ordering as well as final state.

use crate::directory::{DirectoryError, DirectorySource};
use crate::models::{QuestionResponse, RemoteSubscriber, SubscriberLookup, UserRecord};
use crate::notify::{NotifyError, ReportSink};
use crate::reconcile::RunReport;
use crate::remote::{GD_OPTED_OUT, GD_SUBSCRIBER_NOT_FOUND, RemoteError, SubscriptionApi};
use crate::store::{StoreError, SubscriberStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DEFAULT_TOPIC: &str = "ALLSTAFF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    ReadSubscriber(String),
    ReadTopics(String),
    Create(String),
    Delete(String),
    ReplaceTopics(String, Vec<String>),
    /// Email and number of responses submitted.
    SubmitResponses(String, usize),
}

impl RemoteCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            RemoteCall::ReadSubscriber(_) | RemoteCall::ReadTopics(_)
        )
    }

    pub fn email(&self) -> &str {
        match self {
            RemoteCall::ReadSubscriber(email)
            | RemoteCall::ReadTopics(email)
            | RemoteCall::Create(email)
            | RemoteCall::Delete(email)
            | RemoteCall::ReplaceTopics(email, _)
            | RemoteCall::SubmitResponses(email, _) => email,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Injected {
    OptedOut,
    NotFound,
    ServerError,
}

impl Injected {
    fn into_error(self) -> RemoteError {
        match self {
            Injected::OptedOut => RemoteError::OptedOut(GD_OPTED_OUT.to_string()),
            Injected::NotFound => {
                RemoteError::SubscriberNotFound(GD_SUBSCRIBER_NOT_FOUND.to_string())
            }
            Injected::ServerError => server_error(),
        }
    }
}

fn server_error() -> RemoteError {
    RemoteError::Status {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: None,
        body: "injected failure".to_string(),
    }
}

#[derive(Default)]
struct RemoteState {
    subscribers: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<RemoteCall>,
    read_failures: HashSet<String>,
    mutation_failures: HashMap<String, Injected>,
}

/// Subscription service backed by a map of email to topic codes.
pub struct FakeSubscriptionApi {
    topic: String,
    latency: Option<Duration>,
    state: Mutex<RemoteState>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for FakeSubscriptionApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSubscriptionApi {
    pub fn new() -> Self {
        Self::with_topic(DEFAULT_TOPIC)
    }

    pub fn with_topic(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            latency: None,
            state: Mutex::new(RemoteState::default()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Delay every call, so concurrent callers overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert_subscriber(&self, email: &str, topics: &[&str]) {
        self.state.lock().subscribers.insert(
            email.to_string(),
            topics.iter().map(|topic| topic.to_string()).collect(),
        );
    }

    pub fn topics_of(&self, email: &str) -> Option<BTreeSet<String>> {
        self.state.lock().subscribers.get(email).cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(RemoteCall::is_mutation)
            .collect()
    }

    pub fn mutations_for(&self, email: &str) -> Vec<RemoteCall> {
        self.mutations()
            .into_iter()
            .filter(|call| call.email() == email)
            .collect()
    }

    pub fn fail_reads_for(&self, email: &str) {
        self.state.lock().read_failures.insert(email.to_string());
    }

    /// Mutations for `email` fail with the opt-out code.
    pub fn opt_out(&self, email: &str) {
        self.inject(email, Injected::OptedOut);
    }

    /// Mutations for `email` fail with the not-found code.
    pub fn vanish_on_mutation(&self, email: &str) {
        self.inject(email, Injected::NotFound);
    }

    /// Mutations for `email` fail with a 500.
    pub fn fail_mutations_for(&self, email: &str) {
        self.inject(email, Injected::ServerError);
    }

    fn inject(&self, email: &str, failure: Injected) {
        self.state
            .lock()
            .mutation_failures
            .insert(email.to_string(), failure);
    }

    /// Highest number of calls observed in progress at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn read(&self, call: RemoteCall) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        let failing = state.read_failures.contains(call.email());
        state.calls.push(call);
        if failing { Err(server_error()) } else { Ok(()) }
    }

    fn mutate<T>(
        &self,
        call: RemoteCall,
        apply: impl FnOnce(&mut BTreeMap<String, BTreeSet<String>>) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut state = self.state.lock();
        let injected = state.mutation_failures.get(call.email()).copied();
        state.calls.push(call);
        if let Some(failure) = injected {
            return Err(failure.into_error());
        }
        apply(&mut state.subscribers)
    }
}

fn not_found() -> RemoteError {
    RemoteError::SubscriberNotFound(GD_SUBSCRIBER_NOT_FOUND.to_string())
}

#[async_trait]
impl SubscriptionApi for FakeSubscriptionApi {
    async fn read_subscriber(&self, email: &str) -> Result<SubscriberLookup, RemoteError> {
        self.simulate_latency().await;
        self.read(RemoteCall::ReadSubscriber(email.to_string()))?;
        Ok(match self.topics_of(email) {
            Some(_) => SubscriberLookup::Found(RemoteSubscriber {
                email: email.to_string(),
            }),
            None => SubscriberLookup::NotFound,
        })
    }

    async fn read_topics(&self, email: &str) -> Result<BTreeSet<String>, RemoteError> {
        self.simulate_latency().await;
        self.read(RemoteCall::ReadTopics(email.to_string()))?;
        self.topics_of(email).ok_or_else(not_found)
    }

    async fn create_subscriber(&self, email: &str) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let topic = self.topic.clone();
        self.mutate(RemoteCall::Create(email.to_string()), |subscribers| {
            subscribers
                .entry(email.to_string())
                .or_default()
                .insert(topic);
            Ok(())
        })
    }

    async fn delete_subscriber(&self, email: &str) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        self.mutate(RemoteCall::Delete(email.to_string()), |subscribers| {
            subscribers.remove(email).map(|_| ()).ok_or_else(not_found)
        })
    }

    async fn replace_topics(
        &self,
        email: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let call = RemoteCall::ReplaceTopics(email.to_string(), topics.iter().cloned().collect());
        self.mutate(call, |subscribers| match subscribers.get_mut(email) {
            Some(current) => {
                *current = topics.clone();
                Ok(())
            }
            None => Err(not_found()),
        })
    }

    async fn submit_responses(
        &self,
        email: &str,
        responses: &[QuestionResponse],
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let call = RemoteCall::SubmitResponses(email.to_string(), responses.len());
        self.mutate(call, |subscribers| {
            if subscribers.contains_key(email) {
                Ok(())
            } else {
                Err(not_found())
            }
        })
    }
}

/// Directory returning a fixed user list (in the given order) or an error.
pub struct FakeDirectory {
    users: Mutex<Result<Vec<UserRecord>, String>>,
    scopes: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub fn new(users: Vec<UserRecord>) -> Self {
        Self {
            users: Mutex::new(Ok(users)),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            users: Mutex::new(Err(message.to_string())),
            scopes: Mutex::new(Vec::new()),
        }
    }

    pub fn requested_scopes(&self) -> Vec<String> {
        self.scopes.lock().clone()
    }
}

#[async_trait]
impl DirectorySource for FakeDirectory {
    async fn fetch_users(&self, scope: &str) -> Result<Vec<UserRecord>, DirectoryError> {
        self.scopes.lock().push(scope.to_string());
        self.users.lock().clone().map_err(DirectoryError::Query)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Acquire,
    FindAll,
    Upsert(String),
    DeleteById(String),
    DeleteAll,
    Release,
}

#[derive(Default)]
struct StoreState {
    rows: BTreeMap<String, UserRecord>,
    calls: Vec<StoreCall>,
    acquired: bool,
    fail_acquire: bool,
    failing_ids: HashSet<String>,
}

/// Cache store keyed by record id, with the same upsert semantics as the
/// Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<UserRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for record in records {
                state.rows.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn fail_acquire(&self) {
        self.state.lock().fail_acquire = true;
    }

    /// Writes touching `id` fail with a database error.
    pub fn fail_writes_for(&self, id: &str) {
        self.state.lock().failing_ids.insert(id.to_string());
    }

    /// Current rows, ascending by email.
    pub fn records(&self) -> Vec<UserRecord> {
        let mut records: Vec<UserRecord> = self.state.lock().rows.values().cloned().collect();
        records.sort_by(|a, b| a.email.cmp(&b.email));
        records
    }

    pub fn emails(&self) -> Vec<String> {
        self.records().into_iter().map(|record| record.email).collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.state.lock().acquired
    }

    pub fn release_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == StoreCall::Release)
            .count()
    }

    fn write(&self, call: StoreCall, id: &str) -> Result<parking_lot::MutexGuard<'_, StoreState>, StoreError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if !state.acquired {
            return Err(StoreError::NotAcquired);
        }
        if state.failing_ids.contains(id) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "injected write failure for {id}"
            ))));
        }
        Ok(state)
    }
}

#[async_trait]
impl SubscriberStore for MemoryStore {
    async fn acquire(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Acquire);
        if state.fail_acquire {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        state.acquired = true;
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<UserRecord>, StoreError> {
        {
            let mut state = self.state.lock();
            state.calls.push(StoreCall::FindAll);
            if !state.acquired {
                return Err(StoreError::NotAcquired);
            }
        }
        Ok(self.records())
    }

    async fn upsert(&self, record: &UserRecord) -> Result<(), StoreError> {
        let mut state = self.write(StoreCall::Upsert(record.email.clone()), &record.id)?;
        state
            .rows
            .retain(|id, row| row.email != record.email || *id == record.id);
        state.rows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.write(StoreCall::DeleteById(id.to_string()), id)?;
        state.rows.remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut state = self.write(StoreCall::DeleteAll, "")?;
        let removed = state.rows.len() as u64;
        state.rows.clear();
        Ok(removed)
    }

    async fn release(&self) {
        let mut state = self.state.lock();
        state.calls.push(StoreCall::Release);
        state.acquired = false;
    }
}

/// Report sink that keeps every flushed report.
#[derive(Default)]
pub struct CapturingSink {
    reports: Mutex<Vec<RunReport>>,
    failing: bool,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the report, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().clone()
    }

    pub fn last(&self) -> Option<RunReport> {
        self.reports.lock().last().cloned()
    }
}

#[async_trait]
impl ReportSink for CapturingSink {
    async fn flush(&self, report: &RunReport) -> Result<(), NotifyError> {
        self.reports.lock().push(report.clone());
        if self.failing {
            return Err(NotifyError::Rejected("injected sink failure".to_string()));
        }
        Ok(())
    }
}
