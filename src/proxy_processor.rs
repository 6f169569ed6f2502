use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::authgen::AuthGen;
use crate::error::{CoreError, CoreResult};
use crate::model::AsyncTask;
use crate::queue::TaskProcessor;

#[derive(Debug, Clone)]
pub struct ProxyProcessorConfig {
    pub retry_max: u32,
    pub wait_min: Duration,
    pub wait_max: Duration,
    pub per_request_timeout: Duration,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub auth_header_name: String,
    pub key_id: String,
}

impl Default for ProxyProcessorConfig {
    fn default() -> Self {
        Self {
            retry_max: 3,
            wait_min: Duration::from_millis(100),
            wait_max: Duration::from_secs(5),
            per_request_timeout: Duration::from_secs(10),
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            max_conns_per_host: 0,
            idle_conn_timeout: Duration::from_secs(90),
            auth_header_name: "Authorization".to_string(),
            key_id: String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Ack {
    status: String,
}

#[derive(Debug, Deserialize)]
struct NackError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AckEnvelopeMessage {
    ack: Ack,
    #[serde(default)]
    error: Option<NackError>,
}

#[derive(Debug, Deserialize)]
struct AckEnvelope {
    message: AckEnvelopeMessage,
}

/// Retryable HTTP POST with signed headers and ACK/NACK decoding (spec
/// §4.H). Retries happen inside `reqwest-middleware`'s
/// `RetryTransientMiddleware`; this layer only builds the request and
/// interprets the response.
pub struct HttpProxyProcessor {
    config: ProxyProcessorConfig,
    client: ClientWithMiddleware,
    authgen: Arc<dyn AuthGen>,
}

impl HttpProxyProcessor {
    pub fn new(config: ProxyProcessorConfig, authgen: Arc<dyn AuthGen>) -> CoreResult<Self> {
        let inner = reqwest::Client::builder()
            .timeout(config.per_request_timeout)
            .pool_max_idle_per_host(config.max_idle_conns_per_host)
            .pool_idle_timeout(config.idle_conn_timeout)
            .build()
            .map_err(|e| CoreError::transient("building http client", e))?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(config.wait_min, config.wait_max)
            .build_with_max_retries(config.retry_max);

        let client = reqwest_middleware::ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            config,
            client,
            authgen,
        })
    }
}

#[async_trait]
impl TaskProcessor for HttpProxyProcessor {
    async fn process(&self, task: &AsyncTask) -> CoreResult<()> {
        let AsyncTask::Proxy {
            target,
            body,
            headers,
        } = task
        else {
            return Err(CoreError::InvalidTask(
                "proxy processor received a non-PROXY task".to_string(),
            ));
        };

        let mut header_map = HeaderMap::new();
        for (name, values) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| CoreError::InvalidTask(format!("invalid header name {name}: {e}")))?;
            for value in values {
                let header_value = HeaderValue::from_str(value)
                    .map_err(|e| CoreError::InvalidTask(format!("invalid header value: {e}")))?;
                header_map.append(header_name.clone(), header_value);
            }
        }

        if !body.is_empty() && !header_map.contains_key(CONTENT_TYPE) {
            header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        let auth_header_name = HeaderName::from_bytes(self.config.auth_header_name.as_bytes())
            .map_err(|e| CoreError::InvalidTask(format!("invalid auth header name: {e}")))?;
        if !header_map.contains_key(&auth_header_name) {
            let auth_value = self.authgen.auth_header(body, &self.config.key_id).await?;
            let header_value = HeaderValue::from_str(&auth_value)
                .map_err(|e| CoreError::InvalidTask(format!("invalid auth header value: {e}")))?;
            header_map.insert(auth_header_name, header_value);
        }

        let resp = self
            .client
            .post(target.clone())
            .headers(header_map)
            .body(body.clone())
            .send()
            .await
            .map_err(|e| CoreError::transient("proxy request failed", e))?;

        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CoreError::transient("reading proxy response body", e))?;

        if status != reqwest::StatusCode::OK {
            return Err(CoreError::Transient(format!(
                "proxy request to {target} returned status {status}"
            )));
        }

        let envelope: AckEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::transient("decoding ack envelope", e))?;

        if envelope.message.ack.status != "ACK" {
            let (code, message) = envelope
                .message
                .error
                .map(|e| (e.code, e.message))
                .unwrap_or((None, None));
            return Err(CoreError::Nack { code, message });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FixedAuthGen;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task_for(url: reqwest::Url, headers: HashMap<String, Vec<String>>) -> AsyncTask {
        AsyncTask::Proxy {
            target: url,
            body: br#"{"x":1}"#.to_vec(),
            headers,
        }
    }

    fn processor() -> HttpProxyProcessor {
        HttpProxyProcessor::new(
            ProxyProcessorConfig {
                retry_max: 0,
                key_id: "gw-key".into(),
                ..ProxyProcessorConfig::default()
            },
            Arc::new(FixedAuthGen {
                header: "Signature abc".into(),
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ack_response_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"ack": {"status": "ACK"}}
            })))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/search", server.uri())).unwrap();
        let task = task_for(url, HashMap::new());

        processor().process(&task).await.unwrap();
    }

    #[tokio::test]
    async fn nack_response_surfaces_code_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "ack": {"status": "NACK"},
                    "error": {"code": "30001", "message": "invalid signature"}
                }
            })))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/search", server.uri())).unwrap();
        let task = task_for(url, HashMap::new());

        let err = processor().process(&task).await.unwrap_err();
        match err {
            CoreError::Nack { code, message } => {
                assert_eq!(code.as_deref(), Some("30001"));
                assert_eq!(message.as_deref(), Some("invalid signature"));
            }
            other => panic!("expected Nack, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_200_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/search", server.uri())).unwrap();
        let task = task_for(url, HashMap::new());

        let err = processor().process(&task).await.unwrap_err();
        assert!(matches!(err, CoreError::Transient(_)));
    }

    #[tokio::test]
    async fn existing_authorization_header_is_left_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"ack": {"status": "ACK"}}
            })))
            .mount(&server)
            .await;

        let url = reqwest::Url::parse(&format!("{}/search", server.uri())).unwrap();
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), vec!["Bearer caller-token".to_string()]);
        let task = task_for(url, headers);

        processor().process(&task).await.unwrap();
    }

    #[tokio::test]
    async fn non_proxy_task_is_rejected() {
        let task = AsyncTask::Lookup {
            body: vec![],
            headers: HashMap::new(),
            context: crate::model::TaskContext::default(),
        };
        let err = processor().process(&task).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTask(_)));
    }
}
