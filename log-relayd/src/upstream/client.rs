use std::time::Duration;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::protocol::{LOG_STREAMS_RESOURCE, PROVIDER_CREATED_STATUS};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, RelayResult};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateLogStream<'a> {
    service_id: &'a str,
    url: &'a str,
}

#[derive(Deserialize)]
struct CreatedLogStream {
    id: String,
}

/// REST client for the provider's log-stream resource.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    api_base: String,
}

impl ProviderClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("log-relayd/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    fn streams_url(&self) -> String {
        format!("{}/{}", self.api_base, LOG_STREAMS_RESOURCE)
    }

    /// Ask the provider to push the service's logs to `callback_url`.
    /// Only a "created" answer counts; anything else is returned verbatim.
    pub async fn create_log_stream(
        &self,
        credential: &str,
        service_id: &str,
        callback_url: &str,
    ) -> RelayResult<String> {
        let response = self
            .http
            .post(self.streams_url())
            .bearer_auth(credential)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&CreateLogStream { service_id, url: callback_url })
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != PROVIDER_CREATED_STATUS {
            let body = response.text().await?;
            tracing::warn!("Provider rejected log stream for {}: {} {}", service_id, status, body);
            return Err(RelayError::UpstreamRejected(body));
        }

        let created: CreatedLogStream = response.json().await.map_err(|e| {
            RelayError::UpstreamUnreachable(format!("malformed create response: {}", e))
        })?;

        Ok(created.id)
    }

    /// Delete a log stream upstream. A stream the provider no longer knows is
    /// treated as already deleted.
    pub async fn delete_log_stream(&self, credential: &str, stream_id: &str) -> RelayResult<()> {
        let response = self
            .http
            .delete(format!("{}/{}", self.streams_url(), stream_id))
            .bearer_auth(credential)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }

        let body = response.text().await?;
        Err(RelayError::UpstreamRejected(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::mock::MockProvider;

    #[tokio::test]
    async fn test_create_sends_service_and_callback() {
        let provider = MockProvider::start().await;
        let client = ProviderClient::new(&provider.config()).unwrap();

        let id = client
            .create_log_stream("rnd_key", "srv-1", "https://relay.example.com/webhook/ab12CD")
            .await
            .unwrap();
        assert!(id.starts_with("str-"));

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "POST");
        assert_eq!(calls[0].authorization.as_deref(), Some("Bearer rnd_key"));
        assert_eq!(calls[0].body["serviceId"], "srv-1");
        assert_eq!(calls[0].body["url"], "https://relay.example.com/webhook/ab12CD");
    }

    #[tokio::test]
    async fn test_non_created_status_is_rejected_verbatim() {
        let provider = MockProvider::start().await;
        provider.respond_with(400, r#"{"message":"invalid serviceId"}"#);
        let client = ProviderClient::new(&provider.config()).unwrap();

        let err = client.create_log_stream("rnd_key", "bogus", "http://x/webhook").await.unwrap_err();
        match err {
            RelayError::UpstreamRejected(body) => assert_eq!(body, r#"{"message":"invalid serviceId"}"#),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ok_instead_of_created_is_rejected() {
        let provider = MockProvider::start().await;
        provider.respond_with(200, r#"{"id":"str-x"}"#);
        let client = ProviderClient::new(&provider.config()).unwrap();

        let err = client.create_log_stream("rnd_key", "srv-1", "http://x/webhook").await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamRejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_provider() {
        let config = UpstreamConfig {
            api_base: MockProvider::closed_base_url().await,
            timeout_secs: 2,
        };
        let client = ProviderClient::new(&config).unwrap();

        let err = client.create_log_stream("rnd_key", "srv-1", "http://x/webhook").await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnreachable(_)));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_stream() {
        let provider = MockProvider::start().await;
        let client = ProviderClient::new(&provider.config()).unwrap();

        provider.respond_with(404, "not found");
        client.delete_log_stream("rnd_key", "str-gone").await.unwrap();

        let calls = provider.calls();
        assert_eq!(calls[0].method, "DELETE");
        assert_eq!(calls[0].path, "/log-streams/str-gone");
    }
}
