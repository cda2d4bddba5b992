//! Remote subscription service: trait seam, error taxonomy and the
//! GovDelivery REST client.

pub mod client;
pub mod xml;

pub use client::GovDeliveryClient;

use crate::models::{QuestionResponse, SubscriberLookup};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeSet;
use thiserror::Error;

/// Remote code for "subscriber not found".
pub const GD_SUBSCRIBER_NOT_FOUND: &str = "GD-15002";
/// Remote code for "this destination has requested to no longer receive emails".
pub const GD_OPTED_OUT: &str = "GD-15004";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote service returned status {status}: {body}")]
    Status {
        status: StatusCode,
        code: Option<String>,
        body: String,
    },
    #[error("subscriber opted out of notifications ({0})")]
    OptedOut(String),
    #[error("subscriber not found ({0})")]
    SubscriberNotFound(String),
    #[error("failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Classify a non-success response by its parsed error code.
    pub fn from_response(status: StatusCode, body: String) -> Self {
        let code = xml::parse_error_code(&body);
        match code.as_deref() {
            Some(GD_OPTED_OUT) => RemoteError::OptedOut(GD_OPTED_OUT.to_string()),
            Some(GD_SUBSCRIBER_NOT_FOUND) => {
                RemoteError::SubscriberNotFound(GD_SUBSCRIBER_NOT_FOUND.to_string())
            }
            _ => RemoteError::Status { status, code, body },
        }
    }

    /// Opt-outs and missing subscribers skip the record without aborting.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            RemoteError::OptedOut(_) | RemoteError::SubscriberNotFound(_)
        )
    }
}

/// Operations the reconciliation core needs from the subscription service.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    /// `NotFound` is a value, never an error.
    async fn read_subscriber(&self, email: &str) -> Result<SubscriberLookup, RemoteError>;

    async fn read_topics(&self, email: &str) -> Result<BTreeSet<String>, RemoteError>;

    /// Create a subscriber already attached to the managed topic.
    async fn create_subscriber(&self, email: &str) -> Result<(), RemoteError>;

    async fn delete_subscriber(&self, email: &str) -> Result<(), RemoteError>;

    async fn replace_topics(
        &self,
        email: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), RemoteError>;

    /// Replace the subscriber's question responses; an empty slice clears them.
    async fn submit_responses(
        &self,
        email: &str,
        responses: &[QuestionResponse],
    ) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_classification() {
        let opted_out = RemoteError::from_response(
            StatusCode::UNPROCESSABLE_ENTITY,
            "<errors><code>GD-15004</code><error>no longer receive</error></errors>".into(),
        );
        assert!(matches!(opted_out, RemoteError::OptedOut(_)));
        assert!(opted_out.is_soft());

        let missing = RemoteError::from_response(
            StatusCode::NOT_FOUND,
            "<errors><code>GD-15002</code><error>Subscriber not found</error></errors>".into(),
        );
        assert!(matches!(missing, RemoteError::SubscriberNotFound(_)));

        let other = RemoteError::from_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "<errors><code>GD-10000</code><error>mentions GD-15004 in text</error></errors>"
                .into(),
        );
        assert!(!other.is_soft());
        assert!(matches!(
            other,
            RemoteError::Status { code: Some(ref code), .. } if code == "GD-10000"
        ));
    }
}
