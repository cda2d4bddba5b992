//! Decides the minimal remote mutation for one subscriber.
//!
//! The managed topic is the only topic this job owns. A removal must never
//! delete a subscriber who still holds other topics, so the remote state is
//! always read right before mutating; the local cache is never consulted.

use crate::config::AnswerTables;
use crate::error::{SyncError, SyncResult};
use crate::models::{RemoteSubscriptionState, SubscriberLookup, UserRecord};
use crate::remote::SubscriptionApi;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalPlan {
    /// Not on the remote side, or not on the managed topic.
    Noop,
    /// Detach the managed topic, keep `remaining`, clear question responses.
    UnsubscribeTopicOnly { remaining: BTreeSet<String> },
    DeleteSubscriberEntirely,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdditionPlan {
    CreateNewSubscriberWithTopic,
    /// Union the managed topic into the subscriber's existing topics.
    AddTopicToExisting { topics: BTreeSet<String> },
    AlreadySubscribed,
}

impl fmt::Display for RemovalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalPlan::Noop => f.write_str("nothing to remove"),
            RemovalPlan::UnsubscribeTopicOnly { remaining } => {
                write!(f, "unsubscribed from topic, {} other topics kept", remaining.len())
            }
            RemovalPlan::DeleteSubscriberEntirely => f.write_str("subscriber deleted"),
        }
    }
}

impl fmt::Display for AdditionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdditionPlan::CreateNewSubscriberWithTopic => f.write_str("subscriber created"),
            AdditionPlan::AddTopicToExisting { .. } => f.write_str("topic added to existing subscriber"),
            AdditionPlan::AlreadySubscribed => f.write_str("already subscribed, responses refreshed"),
        }
    }
}

/// Reads remote state and applies removal/addition plans for the managed topic.
#[derive(Clone)]
pub struct SubscriptionResolver {
    api: Arc<dyn SubscriptionApi>,
    managed_topic: String,
}

impl SubscriptionResolver {
    pub fn new(api: Arc<dyn SubscriptionApi>, managed_topic: impl Into<String>) -> Self {
        Self {
            api,
            managed_topic: managed_topic.into(),
        }
    }

    /// Existence plus topic membership, straight from the remote service.
    pub async fn fetch_state(&self, email: &str) -> SyncResult<RemoteSubscriptionState> {
        match self
            .api
            .read_subscriber(email)
            .await
            .map_err(|e| SyncError::remote(email, e))?
        {
            SubscriberLookup::NotFound => Ok(RemoteSubscriptionState::Missing),
            SubscriberLookup::Found(subscriber) => {
                let topics = self
                    .api
                    .read_topics(&subscriber.email)
                    .await
                    .map_err(|e| SyncError::remote(email, e))?;
                Ok(RemoteSubscriptionState::Present { topics })
            }
        }
    }

    pub fn plan_removal(&self, state: &RemoteSubscriptionState) -> RemovalPlan {
        match state {
            RemoteSubscriptionState::Missing => RemovalPlan::Noop,
            RemoteSubscriptionState::Present { topics } => {
                if !topics.contains(&self.managed_topic) {
                    return RemovalPlan::Noop;
                }
                let remaining: BTreeSet<String> = topics
                    .iter()
                    .filter(|topic| **topic != self.managed_topic)
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    RemovalPlan::DeleteSubscriberEntirely
                } else {
                    RemovalPlan::UnsubscribeTopicOnly { remaining }
                }
            }
        }
    }

    pub fn plan_addition(&self, state: &RemoteSubscriptionState) -> AdditionPlan {
        match state {
            RemoteSubscriptionState::Missing => AdditionPlan::CreateNewSubscriberWithTopic,
            RemoteSubscriptionState::Present { topics } => {
                if topics.contains(&self.managed_topic) {
                    AdditionPlan::AlreadySubscribed
                } else {
                    let mut topics = topics.clone();
                    topics.insert(self.managed_topic.clone());
                    AdditionPlan::AddTopicToExisting { topics }
                }
            }
        }
    }

    pub async fn resolve_removal(&self, email: &str) -> SyncResult<RemovalPlan> {
        let state = self.fetch_state(email).await?;
        Ok(self.plan_removal(&state))
    }

    pub async fn resolve_addition(&self, email: &str) -> SyncResult<AdditionPlan> {
        let state = self.fetch_state(email).await?;
        Ok(self.plan_addition(&state))
    }

    /// Resolve and perform the removal for `email`.
    pub async fn remove(&self, email: &str) -> SyncResult<RemovalPlan> {
        let plan = self.resolve_removal(email).await?;
        let remote = |e| SyncError::remote(email, e);

        match &plan {
            RemovalPlan::Noop => {
                log::info!("{} is not subscribed to {}, nothing to remove", email, self.managed_topic);
            }
            RemovalPlan::UnsubscribeTopicOnly { remaining } => {
                log::info!(
                    "{} holds {} other topics, removing only {} and its responses",
                    email,
                    remaining.len(),
                    self.managed_topic
                );
                self.api.replace_topics(email, remaining).await.map_err(remote)?;
                self.api.submit_responses(email, &[]).await.map_err(remote)?;
            }
            RemovalPlan::DeleteSubscriberEntirely => {
                log::info!("{} is only subscribed to {}, deleting subscriber", email, self.managed_topic);
                self.api.delete_subscriber(email).await.map_err(remote)?;
            }
        }

        Ok(plan)
    }

    /// Resolve and perform the addition for `record`, then submit its responses.
    pub async fn add(&self, record: &UserRecord, answers: &AnswerTables) -> SyncResult<AdditionPlan> {
        let email = record.email.as_str();
        let plan = self.resolve_addition(email).await?;
        let remote = |e| SyncError::remote(email, e);

        match &plan {
            AdditionPlan::CreateNewSubscriberWithTopic => {
                log::info!("creating {} on {}", email, self.managed_topic);
                self.api.create_subscriber(email).await.map_err(remote)?;
            }
            AdditionPlan::AddTopicToExisting { topics } => {
                log::info!("{} exists, subscribing to {}", email, self.managed_topic);
                self.api.replace_topics(email, topics).await.map_err(remote)?;
            }
            AdditionPlan::AlreadySubscribed => {
                log::info!("{} already subscribed to {}", email, self.managed_topic);
            }
        }

        let responses = answers.responses_for(record);
        self.api.submit_responses(email, &responses).await.map_err(remote)?;
        Ok(plan)
    }

    /// Resubmit question responses for a record whose attributes changed.
    pub async fn refresh_responses(&self, record: &UserRecord, answers: &AnswerTables) -> SyncResult<()> {
        let responses = answers.responses_for(record);
        self.api
            .submit_responses(&record.email, &responses)
            .await
            .map_err(|e| SyncError::remote(record.email.as_str(), e))
    }
}
