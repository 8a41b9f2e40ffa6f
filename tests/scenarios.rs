//! End-to-end scenarios across the dependency manager, workers, checkpoint
//! pipelines and the workgroup supervisor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kued::checkpoint::{checkpoint_handler, CheckpointStore, Decision};
use kued::config::{
    BridgeConfig, DependencyRequest, ProviderConfig, WorkerConfig, WorkgroupConfig,
};
use kued::dependency::{
    into_instance, FactoryContext, Instance, ProviderModule, ProviderOptions, ProviderRef,
};
use kued::logger::default_logger;
use kued::queue::{job_handler, Job, JobContext, JobHandler, MemoryQueue, Queue, QueueError};
use kued::worker::HandlerTable;
use kued::workgroup::{ParentNotifier, StatusMessage, SupervisorError, ERROR_EVENT};
use kued::{CheckpointError, DependencyManager, ModuleCatalog, NodeConfig, Worker, Workgroup};
use serde_json::{json, Value};
use uuid::Uuid;

/// Checkpoint `i` for even `i`, `-1` otherwise.
struct ParityCheckpoints {
    writes: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl CheckpointStore for ParityCheckpoints {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<Value>, CheckpointError> {
        let i: i64 = key.parse().unwrap_or(-1);
        Ok(Some(if i % 2 == 0 { json!(i) } else { json!(-1) }))
    }

    async fn update_checkpoint(&self, key: &str, value: &Value) -> Result<(), CheckpointError> {
        self.writes
            .lock()
            .expect("lock")
            .push((key.to_string(), value.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn test_checkpoint_gates_handler_on_matching_progress() {
    let queue = Arc::new(MemoryQueue::new().with_poll_interval(Duration::from_millis(10)));
    let store = Arc::new(ParityCheckpoints {
        writes: Mutex::new(Vec::new()),
    });
    let worker = Worker::new("sync", Value::Null, default_logger(), queue.clone())
        .with_checkpointer(store.clone());

    let evaluated = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&evaluated);
    let sink = Arc::clone(&handled);
    worker
        .checkpoint()
        .expect("checkpointer")
        .topic("sync")
        .key_factory(|data| data["i"].to_string())
        .iff(move |data, checkpoint| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok(Decision::from_bool(checkpoint.as_ref() == Some(&data["i"]))) }
        })
        .process(checkpoint_handler(move |job, _ctx, _extra| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().expect("lock").push(job.data["i"].clone());
                Ok(None)
            }
        }))
        .await
        .expect("registered");

    for i in 0..5 {
        queue
            .enqueue(Job::new("sync", json!({ "i": i })))
            .await
            .expect("enqueued");
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while evaluated.load(Ordering::SeqCst) < 5 || queue.pending_len("sync") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all jobs evaluated");
    queue.shutdown(Duration::from_secs(1)).await.expect("shutdown");

    let mut handled = handled.lock().expect("lock").clone();
    handled.sort_by_key(|v| v.as_i64());
    assert_eq!(handled, vec![json!(0), json!(2), json!(4)]);
    assert!(store.writes.lock().expect("lock").is_empty());
    assert!(queue.failed("sync").is_empty());
}

/// Keeps the handlers registered through `process`.
#[derive(Default)]
struct RecordingQueue {
    handlers: Mutex<Vec<(String, JobHandler)>>,
}

#[async_trait]
impl Queue for RecordingQueue {
    async fn process(
        &self,
        topic: &str,
        _concurrency: usize,
        handler: JobHandler,
    ) -> Result<(), QueueError> {
        self.handlers
            .lock()
            .expect("lock")
            .push((topic.to_string(), handler));
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        Ok(job.id)
    }

    async fn shutdown(&self, _timeout: Duration) -> Result<(), QueueError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_named_handler_receives_job_payload() {
    let queue = Arc::new(RecordingQueue::default());
    let received = Arc::new(Mutex::new(None));

    let sink = Arc::clone(&received);
    let handlers = HandlerTable::new().with_job(
        "handler",
        job_handler(move |job, _ctx| {
            let sink = Arc::clone(&sink);
            async move {
                *sink.lock().expect("lock") = Some(job.data);
                Ok(())
            }
        }),
    );
    let worker = Worker::new("named", Value::Null, default_logger(), queue.clone())
        .with_handlers(handlers);

    worker.process("test", 1, "handler").await.expect("registered");

    let handler = {
        let handlers = queue.handlers.lock().expect("lock");
        assert_eq!(handlers.len(), 1);
        assert_eq!(handlers[0].0, "test");
        Arc::clone(&handlers[0].1)
    };
    handler(
        Job::new("test", json!({ "foo": "bar" })),
        JobContext {
            topic: "test".to_string(),
            consumer: "test-0".to_string(),
            attempt: 1,
        },
    )
    .await
    .expect("handled");

    assert_eq!(*received.lock().expect("lock"), Some(json!({ "foo": "bar" })));
}

type Greeting = Arc<dyn Fn() -> &'static str + Send + Sync>;

struct NoopProvider {
    value: Greeting,
    creates: Arc<AtomicUsize>,
}

impl ProviderModule for NoopProvider {
    fn options(&self) -> ProviderOptions {
        ProviderOptions::factory().singleton(true)
    }

    fn create(
        &self,
        _ctx: &FactoryContext<'_>,
    ) -> Result<Option<Instance>, kued::DependencyError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Some(into_instance(Arc::clone(&self.value))))
    }
}

#[test]
fn test_singleton_factory_is_created_once() {
    let value: Greeting = Arc::new(|| "noop");
    let creates = Arc::new(AtomicUsize::new(0));
    let provider = NoopProvider {
        value: Arc::clone(&value),
        creates: Arc::clone(&creates),
    };

    let manager = DependencyManager::new(
        vec![ProviderConfig::new("noop", ProviderRef::factory(provider))],
        Arc::new(ModuleCatalog::new()),
    )
    .expect("manager");

    let request = DependencyRequest::new("noop");
    let first: Greeting = manager.require(&request).expect("first");
    let second: Greeting = manager.require(&request).expect("second");

    assert!(Arc::ptr_eq(&first, &value));
    assert!(Arc::ptr_eq(&second, &value));
    assert_eq!(first(), "noop");
    assert_eq!(creates.load(Ordering::SeqCst), 1);
}

#[derive(Default)]
struct CollectingNotifier {
    messages: Mutex<Vec<StatusMessage>>,
}

impl ParentNotifier for CollectingNotifier {
    fn notify(&self, message: StatusMessage) {
        self.messages.lock().expect("lock").push(message);
    }
}

#[tokio::test]
async fn test_dangling_workgroup_member_is_reported() {
    let config = NodeConfig {
        providers: vec![ProviderConfig::module("kue", "kued/providers/memory-queue")],
        workers: vec![WorkerConfig::new("dumper", "kued/workers/dumper")],
        bridges: vec![BridgeConfig::new("relay", "kue:in", "kue:out")],
        workgroup: WorkgroupConfig::new(vec![
            "dumper".to_string(),
            "relay".to_string(),
            "missing-worker".to_string(),
        ]),
    };
    let notifier = Arc::new(CollectingNotifier::default());
    let workgroup = Workgroup::new(
        config,
        Arc::new(ModuleCatalog::with_builtins()),
        notifier.clone(),
    )
    .expect("workgroup");

    let err = workgroup.execute("run").await.expect_err("dangling reference");
    match &err {
        SupervisorError::MissingWorkers(missing) => {
            assert_eq!(missing, &vec!["missing-worker".to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }

    let messages = notifier.messages.lock().expect("lock");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].kind, ERROR_EVENT);
    assert!(messages[0].message.contains("missing-worker"));
    assert!(workgroup.component_names().is_empty());
}
