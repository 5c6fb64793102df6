//! Scheduler integration tests
//!
//! Drives the full actor with scripted mock services and real stores.

use std::sync::Arc;
use std::time::Duration;

use resumr::domain::{
    HistoryQuery, NewTask, PersistedSnapshot, Priority, ServiceStatus, Task, TaskKind, TaskPayload, TaskStatus,
};
use resumr::error::{ResumrError, Result, TaskError};
use resumr::events::{EventBus, SchedulerEvent};
use resumr::id::now_ms;
use resumr::providers::MockProvider;
use resumr::registry::ProbeReport;
use resumr::scheduler::{RetryPolicy, Scheduler, SchedulerHandle, SchedulerSettings, SchedulerStatus};
use resumr::store::{Collection, Persistence, RecordRow, SqliteStore, TransactionalStore};
use serde_json::json;
use tempfile::TempDir;

const SERVICE: &str = "mock";
const HOUR: i64 = 60 * 60 * 1000;

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        probe_interval: Duration::from_secs(3600),
        probe_timeout: Duration::from_secs(1),
        task_timeout: Duration::from_secs(10),
        cleanup_interval: Duration::from_secs(3600),
        command_buffer: 32,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            jitter: 0.1,
        },
    }
}

fn job(name: &str) -> TaskPayload {
    TaskPayload::Custom {
        name: "job".to_string(),
        data: json!({ "name": name }),
    }
}

fn request(name: &str, priority: Priority) -> NewTask {
    NewTask::new(SERVICE, job(name)).with_priority(priority)
}

fn job_name(task: &Task) -> String {
    match &task.payload {
        TaskPayload::Custom { data, .. } => data["name"].as_str().unwrap_or_default().to_string(),
        other => panic!("unexpected payload {:?}", other),
    }
}

fn sqlite(temp: &TempDir) -> Persistence {
    Persistence::new(Arc::new(SqliteStore::open_at(temp.path()).unwrap()))
}

/// A service that never reports capacity, so queued tasks stay put.
fn blocked() -> Arc<MockProvider> {
    Arc::new(MockProvider::new(SERVICE).with_probe(Ok(ProbeReport::limited(Some(now_ms() + HOUR)))))
}

async fn start(mock: Arc<MockProvider>, persistence: Option<Persistence>) -> Scheduler {
    let mut builder = Scheduler::builder(settings())
        .service(mock.clone())
        .handler(TaskKind::Custom("job".to_string()), mock);
    if let Some(persistence) = persistence {
        builder = builder.store(persistence);
    }
    builder.start().await.unwrap()
}

async fn wait_for<F>(handle: &SchedulerHandle, mut done: F) -> SchedulerStatus
where
    F: FnMut(&SchedulerStatus) -> bool,
{
    for _ in 0..300 {
        let status = handle.status().await.unwrap();
        if done(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 3s");
}

#[tokio::test]
async fn test_queue_orders_by_priority() {
    let scheduler = start(blocked(), None).await;
    let handle = scheduler.handle();

    handle.enqueue(request("normal", Priority::Normal)).await.unwrap();
    handle.enqueue(request("critical", Priority::Critical)).await.unwrap();
    handle.enqueue(request("high", Priority::High)).await.unwrap();

    let status = handle.status().await.unwrap();
    let order: Vec<String> = status.queue.iter().map(job_name).collect();
    assert_eq!(order, vec!["critical", "high", "normal"]);
    assert!(status.current_task.is_none());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_identical_payloads_keep_their_own_priority() {
    let scheduler = start(blocked(), None).await;
    let handle = scheduler.handle();

    let normal = handle.enqueue(request("same", Priority::Normal)).await.unwrap();
    let critical = handle.enqueue(request("same", Priority::Critical)).await.unwrap();
    let high = handle.enqueue(request("same", Priority::High)).await.unwrap();
    assert!(!critical.is_attached() && !high.is_attached());

    let status = handle.status().await.unwrap();
    let order: Vec<&str> = status.queue.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(order, vec![critical.id(), high.id(), normal.id()]);

    // An explicit key coalesces and lifts the live task
    let keyed = handle
        .enqueue(request("keyed", Priority::Low).with_idempotency_key("k"))
        .await
        .unwrap();
    let again = handle
        .enqueue(request("keyed", Priority::Critical).with_idempotency_key("k"))
        .await
        .unwrap();
    assert!(again.is_attached());
    assert_eq!(again.id(), keyed.id());

    let status = handle.status().await.unwrap();
    assert_eq!(status.queue.len(), 4);
    assert_eq!(status.queue[1].id, keyed.id());
    assert_eq!(status.queue[1].priority, Priority::Critical);

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_task_returns_to_queue_head() {
    let reset = now_ms() + 60_000;
    let mock = Arc::new(MockProvider::new(SERVICE).with_outcome(Err(TaskError::RateLimited {
        reset_time: Some(reset),
        message: "429 Too Many Requests".to_string(),
    })));
    let scheduler = start(mock.clone(), None).await;
    let mut events = scheduler.bus().subscribe();
    let handle = scheduler.handle();

    let task = handle.enqueue(request("t", Priority::Normal)).await.unwrap();
    let status = wait_for(&handle, |s| s.services[0].status == ServiceStatus::Limited).await;

    let head = &status.queue[0];
    assert_eq!(head.id, task.id());
    assert_eq!(head.status, TaskStatus::Pending);
    assert_eq!(head.retry_count, 0);
    assert!(status.current_task.is_none());
    assert_eq!(status.services[0].reset_time, Some(reset));
    assert_eq!(mock.executed().len(), 1);

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        SchedulerEvent::Exhausted {
            service_id,
            reset_time,
            queue_length,
            ..
        } => {
            assert_eq!(service_id, SERVICE);
            assert_eq!(reset_time, Some(reset));
            assert_eq!(queue_length, 1);
        }
        other => panic!("expected exhausted event, got {:?}", other),
    }

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_exhaust_retries_and_archive() {
    let temp = TempDir::new().unwrap();
    let persistence = sqlite(&temp);
    let mock = Arc::new(MockProvider::new(SERVICE));
    for _ in 0..4 {
        mock.push_outcome(Err(TaskError::Transient("503".to_string())));
    }
    let scheduler = start(mock.clone(), Some(persistence.clone())).await;
    let mut events = scheduler.bus().subscribe();

    let task = scheduler.handle().enqueue(request("flaky", Priority::High)).await.unwrap();
    let id = task.id().to_string();
    let outcome = tokio::time::timeout(Duration::from_secs(3), task.wait()).await.unwrap();
    assert_eq!(outcome, Err(TaskError::Transient("503".to_string())));
    assert_eq!(mock.executed(), vec![id.clone(); 4]);

    let history = persistence
        .query_history(&HistoryQuery::default().with_status(TaskStatus::Failed))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task.id, id);
    assert_eq!(history[0].task.retry_count, 4);
    assert!(history[0].task.failed_at.is_some());

    let failed = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(failed, SchedulerEvent::TaskFailed { task_id, .. } if task_id == id));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_snapshot_is_discarded() {
    let temp = TempDir::new().unwrap();
    let persistence = sqlite(&temp);
    let now = now_ms();

    let stale_task = Task::from_request(request("old", Priority::Normal), now - 30 * HOUR);
    let mut snapshot = PersistedSnapshot::empty(now - 30 * HOUR);
    snapshot.queue.push(stale_task.clone());
    persistence.save_snapshot(&snapshot).unwrap();
    persistence.replace_queue(&[stale_task], now - 30 * HOUR).unwrap();

    let scheduler = start(blocked(), Some(persistence.clone())).await;
    let status = scheduler.handle().status().await.unwrap();
    assert!(status.queue.is_empty());
    assert!(!status.memory_only);
    assert!(persistence.load_queue().unwrap().is_empty());

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let scheduler = start(blocked(), None).await;
    let handle = scheduler.handle();

    handle.enqueue(request("a", Priority::High)).await.unwrap();
    let target = handle.enqueue(request("b", Priority::High)).await.unwrap();
    handle.enqueue(request("c", Priority::High)).await.unwrap();
    let before = handle.status().await.unwrap().queue.len();

    assert!(handle.cancel(target.id()).await.unwrap());
    let status = handle.status().await.unwrap();
    assert_eq!(status.queue.len(), before - 1);
    assert!(status.queue.iter().all(|t| t.id != target.id()));
    assert!(!handle.cancel(target.id()).await.unwrap());
    assert_eq!(target.wait().await, Err(TaskError::Cancelled));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_interrupted_and_queued_tasks() {
    let temp = TempDir::new().unwrap();

    let slow = Arc::new(MockProvider::new(SERVICE).with_execute_delay(Duration::from_secs(30)));
    let first = start(slow, Some(sqlite(&temp))).await;
    let handle = first.handle();
    let running = handle.enqueue(request("running", Priority::Normal)).await.unwrap();
    let running_id = running.id().to_string();
    handle.enqueue(request("waiting", Priority::Normal)).await.unwrap();
    wait_for(&handle, |s| s.current_task.is_some()).await;
    first.shutdown().await.unwrap();
    assert_eq!(running.wait().await, Err(TaskError::Shutdown));

    let persistence = sqlite(&temp);
    let restored = persistence.load_latest_snapshot(now_ms()).unwrap().unwrap();
    assert!(restored.current_task.is_none());
    assert_eq!(restored.queue.len(), 2);
    assert_eq!(job_name(&restored.queue[0]), "running");

    let fast = Arc::new(MockProvider::new(SERVICE));
    let second = start(fast.clone(), Some(persistence.clone())).await;
    let status = wait_for(&second.handle(), |s| s.queue.is_empty() && s.current_task.is_none()).await;
    assert!(status.retrying.is_empty());

    let executed = fast.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0], running_id);

    let history = persistence.query_history(&HistoryQuery::default()).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.task.status == TaskStatus::Completed && r.task.retry_count == 0));

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_token_exhausted_reclaims_running_task() {
    let reset = now_ms() + HOUR;
    let mock = Arc::new(
        MockProvider::new(SERVICE)
            .with_probe(Ok(ProbeReport::available()))
            .with_probe(Ok(ProbeReport::limited(Some(reset))))
            .with_execute_delay(Duration::from_secs(30)),
    );
    let scheduler = start(mock.clone(), None).await;
    let mut events = scheduler.bus().subscribe();
    let handle = scheduler.handle();

    let task = handle.enqueue(request("long", Priority::Low)).await.unwrap();
    wait_for(&handle, |s| s.current_task.is_some()).await;

    handle
        .on_token_exhausted(SERVICE, json!({ "reset_time": reset, "tokens_used": 9000 }))
        .await
        .unwrap();

    let status = handle.status().await.unwrap();
    assert!(status.current_task.is_none());
    let head = &status.queue[0];
    assert_eq!(head.id, task.id());
    assert_eq!(head.status, TaskStatus::Pending);
    assert_eq!(head.retry_count, 0);
    assert_eq!(head.context["tokens_used"], json!(9000));
    assert_eq!(status.services[0].status, ServiceStatus::Limited);
    assert_eq!(status.services[0].reset_time, Some(reset));

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, SchedulerEvent::Exhausted { queue_length: 1, .. }));

    // The follow-up reprobe still reports limited, so nothing is redispatched.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.probe_count() >= 2);
    assert_eq!(mock.executed().len(), 1);

    let err = handle.on_token_exhausted("nope", json!({})).await.unwrap_err();
    assert!(matches!(err, ResumrError::UnknownService(_)));

    scheduler.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovery_event_after_retry_now() {
    let mock = Arc::new(MockProvider::new(SERVICE).with_probe(Ok(ProbeReport::limited(None))));
    let scheduler = start(mock.clone(), None).await;
    let mut events = scheduler.bus().subscribe();
    let handle = scheduler.handle();

    let task = handle.enqueue(request("held", Priority::Normal)).await.unwrap();
    assert!(mock.executed().is_empty());

    mock.set_probe(Ok(ProbeReport::available()));
    handle.retry_now().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task.wait()).await.unwrap();
    assert!(result.is_ok());

    let first = events.recv().await.unwrap();
    assert!(matches!(first, SchedulerEvent::ServiceRecovered { .. }));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, SchedulerEvent::TaskCompleted { .. }));

    scheduler.shutdown().await.unwrap();
}

/// Store whose writes always fail.
struct BrokenStore;

impl TransactionalStore for BrokenStore {
    fn replace_all(&self, _: Collection, _: &[RecordRow]) -> Result<()> {
        Err(ResumrError::Storage("disk full".to_string()))
    }

    fn replace_where(&self, _: Collection, _: &str, _: &str, _: &RecordRow) -> Result<()> {
        Err(ResumrError::Storage("disk full".to_string()))
    }

    fn append_many(&self, _: Collection, _: &[RecordRow]) -> Result<()> {
        Err(ResumrError::Storage("disk full".to_string()))
    }

    fn list(&self, _: Collection) -> Result<Vec<RecordRow>> {
        Ok(Vec::new())
    }

    fn query_by_index(&self, _: Collection, _: &str, _: &str) -> Result<Vec<RecordRow>> {
        Ok(Vec::new())
    }

    fn latest_where(&self, _: Collection, _: &str, _: &str) -> Result<Option<RecordRow>> {
        Ok(None)
    }

    fn delete_where(&self, _: Collection, _: &str, _: &str) -> Result<usize> {
        Ok(0)
    }

    fn delete_older_than(&self, _: Collection, _: i64) -> Result<usize> {
        Ok(0)
    }

    fn clear(&self, _: Collection) -> Result<usize> {
        Ok(0)
    }

    fn count(&self, _: Collection) -> Result<usize> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_persistence_failure_falls_back_to_memory() {
    let mock = Arc::new(MockProvider::new(SERVICE));
    let scheduler = start(mock, Some(Persistence::new(Arc::new(BrokenStore)))).await;
    let handle = scheduler.handle();

    let task = handle.enqueue(request("still runs", Priority::Normal)).await.unwrap();
    assert!(task.wait().await.is_ok());
    assert!(handle.status().await.unwrap().memory_only);

    scheduler.shutdown().await.unwrap();
}
