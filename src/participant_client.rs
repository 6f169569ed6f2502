use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

/// Body of the `on_subscribe` callback the registry issues to a
/// participant's `url` to confirm control of the key material being
/// registered (spec §4.F step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnSubscribeRequest {
    pub subscriber_id: String,
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnSubscribeResponse {
    pub answer: String,
}

/// Capability interface for reaching a participant's own endpoint (spec
/// §4.E). The wire-level signature header format participants expect is
/// out of scope (§1 Non-goals); this covers the HTTP round trip and
/// response decoding only.
#[async_trait]
pub trait ParticipantClient: Send + Sync {
    async fn on_subscribe(
        &self,
        callback_url: &str,
        request: OnSubscribeRequest,
    ) -> CoreResult<OnSubscribeResponse>;
}

pub struct HttpParticipantClient {
    client: ClientWithMiddleware,
}

impl HttpParticipantClient {
    pub fn new(client: ClientWithMiddleware) -> Self {
        Self { client }
    }

    pub fn with_timeout(timeout: Duration) -> CoreResult<Self> {
        let inner = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::transient("building http client", e))?;
        Ok(Self {
            client: reqwest_middleware::ClientBuilder::new(inner).build(),
        })
    }
}

#[async_trait]
impl ParticipantClient for HttpParticipantClient {
    async fn on_subscribe(
        &self,
        callback_url: &str,
        request: OnSubscribeRequest,
    ) -> CoreResult<OnSubscribeResponse> {
        let endpoint = format!("{}/on_subscribe", callback_url.trim_end_matches('/'));

        let resp = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::transient("calling on_subscribe", e))?;

        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!(
                "on_subscribe at {endpoint} returned status {}",
                resp.status()
            )));
        }

        resp.json::<OnSubscribeResponse>()
            .await
            .map_err(|e| CoreError::transient("decoding on_subscribe response", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn on_subscribe_posts_challenge_and_returns_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/on_subscribe"))
            .respond_with(ResponseTemplate::new(200).set_body_json(OnSubscribeResponse {
                answer: "decrypted-value".into(),
            }))
            .mount(&server)
            .await;

        let client = HttpParticipantClient::with_timeout(Duration::from_secs(5)).unwrap();
        let resp = client
            .on_subscribe(
                &server.uri(),
                OnSubscribeRequest {
                    subscriber_id: "sub1".into(),
                    challenge: "enc-challenge".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.answer, "decrypted-value");
    }

    #[tokio::test]
    async fn on_subscribe_surfaces_non_success_status_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/on_subscribe"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpParticipantClient::with_timeout(Duration::from_secs(5)).unwrap();
        let err = client
            .on_subscribe(
                &server.uri(),
                OnSubscribeRequest {
                    subscriber_id: "sub1".into(),
                    challenge: "enc-challenge".into(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Transient(_)));
    }
}
