use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::authgen::AuthGen;
use crate::error::{CoreError, CoreResult};
use crate::model::{AsyncTask, SubscriptionFilter};
use crate::queue::TaskQueue;
use crate::repository::Repository;

#[derive(Debug, Clone)]
pub struct LookupProcessorConfig {
    pub subscriber_id: String,
    /// 0 means no cap.
    pub max_proxy_tasks: usize,
    pub key_id: String,
}

/// Registry lookup + fanout enqueue (spec §4.I). Builds one authenticated
/// header set, reused across every matched subscriber, and re-enqueues a
/// PROXY task per subscriber up to `max_proxy_tasks`.
pub struct LookupProcessor {
    config: LookupProcessorConfig,
    repository: Arc<dyn Repository>,
    authgen: Arc<dyn AuthGen>,
    queue: Arc<TaskQueue>,
}

impl LookupProcessor {
    pub fn new(
        config: LookupProcessorConfig,
        repository: Arc<dyn Repository>,
        authgen: Arc<dyn AuthGen>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            config,
            repository,
            authgen,
            queue,
        }
    }
}

#[async_trait]
impl crate::queue::TaskProcessor for LookupProcessor {
    async fn process(&self, task: &AsyncTask) -> CoreResult<()> {
        let AsyncTask::Lookup {
            body,
            headers: _headers,
            context,
        } = task
        else {
            return Err(CoreError::InvalidTask(
                "lookup processor received a non-LOOKUP task".to_string(),
            ));
        };

        if body.is_empty() {
            return Err(CoreError::InvalidTask(
                "lookup task body must not be empty".to_string(),
            ));
        }

        let filter = SubscriptionFilter::new().with_domain(context.domain.clone());
        let subscriptions = self.repository.lookup(&filter).await?;

        let auth_header = self
            .authgen
            .auth_header(body, &self.config.key_id)
            .await?;

        let mut fanout_headers: HashMap<String, Vec<String>> = HashMap::new();
        fanout_headers.insert("Authorization".to_string(), vec![auth_header]);

        let mut enqueued = 0usize;
        let mut last_error: Option<CoreError> = None;

        for sub in subscriptions {
            if sub.url.is_empty() {
                continue;
            }
            if self.config.max_proxy_tasks != 0 && enqueued >= self.config.max_proxy_tasks {
                break;
            }

            let target = format!("{}/{}", sub.url.trim_end_matches('/'), context.action);
            let target = match reqwest::Url::parse(&target) {
                Ok(url) => url,
                Err(e) => {
                    last_error = Some(CoreError::InvalidTask(format!(
                        "invalid fanout target for subscriber {}: {e}",
                        sub.subscriber_id
                    )));
                    continue;
                }
            };

            let proxy_task = AsyncTask::Proxy {
                target,
                body: body.clone(),
                headers: fanout_headers.clone(),
            };

            match self.queue.enqueue(proxy_task).await {
                Ok(()) => enqueued += 1,
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
