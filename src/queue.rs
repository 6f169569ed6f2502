use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{CoreError, CoreResult};
use crate::model::{AsyncTask, TaskContext, TaskKind};

/// A processor attached to one task kind (spec §9 "Variants" / §4.G "two
/// processor slots"). `proxy_processor` and `lookup_processor` both
/// implement this.
#[async_trait::async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &AsyncTask) -> CoreResult<()>;
}

/// Holds the optionally-attached lookup processor (spec §4.G:
/// "`proxy_processor` required at construction, `lookup_processor` may be
/// attached later").
pub type LookupSlot = Arc<RwLock<Option<Arc<dyn TaskProcessor>>>>;

pub fn empty_lookup_slot() -> LookupSlot {
    Arc::new(RwLock::new(None))
}

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub capacity: usize,
    pub workers: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            workers: DEFAULT_WORKERS,
        }
    }
}

/// Classifies an incoming request into a queued task (spec §4.G
/// `QueueTxn`). `bpp_uri`/`bap_uri` come from the request context; an empty
/// string is treated the same as absent.
pub fn classify(
    context: &TaskContext,
    body: Vec<u8>,
    headers: HashMap<String, Vec<String>>,
) -> CoreResult<AsyncTask> {
    match context.action.as_str() {
        "search" => {
            if !context.bpp_uri.is_empty() {
                let target = build_target(&context.bpp_uri, "search")?;
                Ok(AsyncTask::Proxy {
                    target,
                    body,
                    headers,
                })
            } else {
                Ok(AsyncTask::Lookup {
                    body,
                    headers,
                    context: context.clone(),
                })
            }
        }
        "on_search" => {
            if context.bap_uri.is_empty() {
                return Err(CoreError::InvalidTask(
                    "on_search requires a non-empty BapURI".to_string(),
                ));
            }
            let target = build_target(&context.bap_uri, "on_search")?;
            Ok(AsyncTask::Proxy {
                target,
                body,
                headers,
            })
        }
        other => Err(CoreError::UnknownAction(other.to_string())),
    }
}

fn build_target(base: &str, action: &str) -> CoreResult<Url> {
    let joined = format!("{}/{}", base.trim_end_matches('/'), action);
    Url::parse(&joined).map_err(|e| CoreError::InvalidTask(format!("invalid target URI: {e}")))
}

/// Bounded-channel worker pool (spec §4.G). Exactly one owner of the
/// channel-close operation: `stop` is guarded by an `AtomicBool` so a
/// double call is a no-op rather than a panic (§5 "double-close is a
/// defect").
pub struct TaskQueue {
    sender: Mutex<Option<mpsc::Sender<AsyncTask>>>,
    stopped: AtomicBool,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn start(
        config: TaskQueueConfig,
        proxy_processor: Arc<dyn TaskProcessor>,
        lookup_processor: LookupSlot,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for _ in 0..config.workers.max(1) {
            let receiver = receiver.clone();
            let proxy_processor = proxy_processor.clone();
            let lookup_processor = lookup_processor.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(receiver, proxy_processor, lookup_processor).await;
            }));
        }

        Self {
            sender: Mutex::new(Some(sender)),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task, blocking while the channel is full (spec §5
    /// backpressure). Fails rather than panicking once the queue has been
    /// stopped.
    pub async fn enqueue(&self, task: AsyncTask) -> CoreResult<()> {
        let sender = {
            let guard = self.sender.lock().await;
            guard.clone()
        };
        match sender {
            Some(sender) => sender.send(task).await.map_err(|_| CoreError::QueueStopped),
            None => Err(CoreError::QueueStopped),
        }
    }

    /// Closes the sending side so workers drain remaining items and exit.
    /// Exactly one caller performs the actual close (spec §5 "exactly one
    /// owner of the channel close operation"); later calls are a no-op
    /// rather than a panic.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping every clone of the sender closes the channel; workers
        // observe it via `recv() == None` and exit.
        self.sender.lock().await.take();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    receiver: Arc<Mutex<mpsc::Receiver<AsyncTask>>>,
    proxy_processor: Arc<dyn TaskProcessor>,
    lookup_processor: LookupSlot,
) {
    loop {
        let task = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            return;
        };

        let result = match task.kind() {
            TaskKind::Proxy => proxy_processor.process(&task).await,
            TaskKind::Lookup => {
                let processor = lookup_processor.read().await.clone();
                match processor {
                    Some(processor) => processor.process(&task).await,
                    None => {
                        tracing::warn!("dropping LOOKUP task: no lookup_processor attached");
                        continue;
                    }
                }
            }
        };

        if let Err(err) = result {
            tracing::error!(error = %err, kind = ?task.kind(), "task processor failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn ctx(action: &str, bpp: &str, bap: &str) -> TaskContext {
        TaskContext {
            domain: "d1".into(),
            action: action.into(),
            bap_uri: bap.into(),
            bpp_uri: bpp.into(),
        }
    }

    #[test]
    fn search_with_bpp_uri_classifies_as_proxy() {
        let task = classify(&ctx("search", "http://bpp", ""), vec![], HashMap::new()).unwrap();
        match task {
            AsyncTask::Proxy { target, .. } => assert_eq!(target.as_str(), "http://bpp/search"),
            _ => panic!("expected proxy task"),
        }
    }

    #[test]
    fn search_without_bpp_uri_classifies_as_lookup() {
        let task = classify(&ctx("search", "", ""), vec![], HashMap::new()).unwrap();
        assert_eq!(task.kind(), TaskKind::Lookup);
    }

    #[test]
    fn on_search_without_bap_uri_is_an_error() {
        let err = classify(&ctx("on_search", "", ""), vec![], HashMap::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTask(_)));
    }

    #[test]
    fn on_search_with_bap_uri_classifies_as_proxy() {
        let task = classify(&ctx("on_search", "", "http://bap"), vec![], HashMap::new()).unwrap();
        match task {
            AsyncTask::Proxy { target, .. } => assert_eq!(target.as_str(), "http://bap/on_search"),
            _ => panic!("expected proxy task"),
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = classify(&ctx("bogus", "", ""), vec![], HashMap::new()).unwrap_err();
        assert!(matches!(err, CoreError::UnknownAction(_)));
    }

    struct CountingProcessor {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TaskProcessor for CountingProcessor {
        async fn process(&self, _task: &AsyncTask) -> CoreResult<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn enqueued_proxy_tasks_reach_the_proxy_processor() {
        let proxy = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
        });
        let lookup_slot: LookupSlot = empty_lookup_slot();

        let mut queue = TaskQueue::start(TaskQueueConfig::default(), proxy.clone(), lookup_slot);

        let task = classify(&ctx("search", "http://bpp", ""), vec![], HashMap::new()).unwrap();
        queue.enqueue(task).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(proxy.count.load(Ordering::SeqCst), 1);

        queue.stop().await;
    }

    #[tokio::test]
    async fn lookup_task_without_attached_processor_is_dropped_not_panicked() {
        let proxy = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
        });
        let lookup_slot: LookupSlot = empty_lookup_slot();

        let mut queue = TaskQueue::start(TaskQueueConfig::default(), proxy, lookup_slot);
        let task = classify(&ctx("search", "", ""), vec![], HashMap::new()).unwrap();
        queue.enqueue(task).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn enqueue_after_stop_fails_instead_of_panicking() {
        let proxy = Arc::new(CountingProcessor {
            count: AtomicUsize::new(0),
        });
        let lookup_slot: LookupSlot = empty_lookup_slot();
        let mut queue = TaskQueue::start(TaskQueueConfig::default(), proxy, lookup_slot);

        queue.stop().await;
        queue.stop().await; // double-stop must be a no-op, not a panic

        let task = classify(&ctx("search", "http://bpp", ""), vec![], HashMap::new()).unwrap();
        let err = queue.enqueue(task).await.unwrap_err();
        assert!(matches!(err, CoreError::QueueStopped));
    }
}
