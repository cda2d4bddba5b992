use super::xml::{compose_responses, compose_subscriber, compose_topics, parse_topics};
use super::{RemoteError, SubscriptionApi};
use crate::config::RemoteConfig;
use crate::models::{QuestionResponse, RemoteSubscriber, SubscriberLookup};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Method, RequestBuilder, Response};
use std::collections::BTreeSet;
use std::time::Duration;

const NO_NOTIFICATIONS: &str = "send_notifications=false";

/// REST client for the GovDelivery subscriber API.
#[derive(Clone)]
pub struct GovDeliveryClient {
    http: reqwest::Client,
    config: RemoteConfig,
}

impl GovDeliveryClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("subscriber-sync/0.1")
            .build()
            .map_err(RemoteError::Http)?;

        Ok(Self {
            http: client,
            config,
        })
    }

    fn account_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.account_code
        )
    }

    /// Subscribers are addressed by the base64 encoding of their email.
    fn subscriber_url(&self, email: &str, suffix: &str) -> String {
        format!(
            "{}/subscribers/{}{}.xml",
            self.account_url(),
            STANDARD.encode(email.as_bytes()),
            suffix
        )
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
    }

    async fn check(response: Response) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(RemoteError::from_response(status, body))
        }
    }

    async fn send(&self, method: Method, url: String, body: String) -> Result<(), RemoteError> {
        log::debug!("{} {}", method, url);
        let response = self.request(method, url).body(body).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionApi for GovDeliveryClient {
    async fn read_subscriber(&self, email: &str) -> Result<SubscriberLookup, RemoteError> {
        let url = self.subscriber_url(email, "");
        let response = self.request(Method::GET, url).send().await?;

        match Self::check(response).await {
            Ok(_) => Ok(SubscriberLookup::Found(RemoteSubscriber {
                email: email.to_string(),
            })),
            Err(RemoteError::SubscriberNotFound(_)) => Ok(SubscriberLookup::NotFound),
            Err(err) => Err(err),
        }
    }

    async fn read_topics(&self, email: &str) -> Result<BTreeSet<String>, RemoteError> {
        let url = self.subscriber_url(email, "/topics");
        let response = self.request(Method::GET, url).send().await?;
        let body = Self::check(response).await?.text().await?;
        parse_topics(&body).map_err(RemoteError::Decode)
    }

    async fn create_subscriber(&self, email: &str) -> Result<(), RemoteError> {
        let url = format!("{}/subscriptions.xml", self.account_url());
        let body = compose_subscriber(email, &self.config.topic_code);
        self.send(Method::POST, url, body).await
    }

    async fn delete_subscriber(&self, email: &str) -> Result<(), RemoteError> {
        let url = format!("{}?{}", self.subscriber_url(email, ""), NO_NOTIFICATIONS);
        self.send(Method::DELETE, url, String::new()).await
    }

    async fn replace_topics(
        &self,
        email: &str,
        topics: &BTreeSet<String>,
    ) -> Result<(), RemoteError> {
        let url = format!("{}?{}", self.subscriber_url(email, "/topics"), NO_NOTIFICATIONS);
        self.send(Method::PUT, url, compose_topics(topics)).await
    }

    async fn submit_responses(
        &self,
        email: &str,
        responses: &[QuestionResponse],
    ) -> Result<(), RemoteError> {
        let url = format!(
            "{}?{}",
            self.subscriber_url(email, "/responses"),
            NO_NOTIFICATIONS
        );
        self.send(Method::PUT, url, compose_responses(responses)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GovDeliveryClient {
        GovDeliveryClient::new(RemoteConfig {
            base_url: "https://api.example.test/api/account/".into(),
            account_code: "USNCI".into(),
            user: "svc".into(),
            password: "secret".into(),
            topic_code: "USNCI_1".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_subscriber_url_encodes_email() {
        let url = client().subscriber_url("a@x.gov", "/topics");
        assert_eq!(
            url,
            "https://api.example.test/api/account/USNCI/subscribers/YUB4Lmdvdg==/topics.xml"
        );
    }
}
