//! Scheduler actor and its public handle.
//!
//! One tokio task owns the [`SchedulerCore`] and reacts to:
//! 1. Commands from [`SchedulerHandle`]s (enqueue, cancel, status, ...)
//! 2. Probe results and handler completions from tasks it spawned
//! 3. The probe interval, the retention interval, and the next retry or
//!    reset due time
//!
//! After every event it tries to dispatch the next runnable task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{DeferredRetry, HistoryRecord, NewTask, Service, Task, TaskKind};
use crate::error::{ResumrError, Result, TaskError};
use crate::events::{BroadcastBus, EventBus, SchedulerEvent};
use crate::id::now_ms;
use crate::providers::{HandlerRegistry, TaskHandler};
use crate::registry::{ProbeOutcome, Prober, ServiceProvider, ServiceRegistry, StatusChange};
use crate::scheduler::core::{Completion, Dispatch, Enqueued, SchedulerCore};
use crate::scheduler::retry::RetryPolicy;
use crate::store::Persistence;

/// Timing and retry settings for the scheduler actor.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Upper bound on one handler execution; expiry counts as transient
    pub task_timeout: Duration,
    pub cleanup_interval: Duration,
    pub command_buffer: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            task_timeout: Duration::from_secs(120),
            cleanup_interval: Duration::from_secs(60 * 60),
            command_buffer: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            probe_interval: config.scheduler.probe_interval(),
            probe_timeout: config.scheduler.probe_timeout(),
            task_timeout: config.scheduler.task_timeout(),
            cleanup_interval: config.storage.cleanup_interval(),
            command_buffer: config.scheduler.command_buffer.max(1),
            retry: RetryPolicy::from(&config.retry),
        }
    }
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub services: Vec<Service>,
    pub queue: Vec<Task>,
    pub current_task: Option<Task>,
    pub retrying: Vec<DeferredRetry>,
    /// Persistence failed earlier and the scheduler stopped writing
    pub memory_only: bool,
}

/// Resolves once the task completes, fails, is cancelled, or the scheduler stops.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    attached: bool,
    rx: oneshot::Receiver<std::result::Result<Value, TaskError>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the request's idempotency key matched a live task and was attached to it.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub async fn wait(self) -> std::result::Result<Value, TaskError> {
        self.rx.await.unwrap_or(Err(TaskError::Shutdown))
    }
}

type Reply<T> = oneshot::Sender<T>;
type Waiter = oneshot::Sender<std::result::Result<Value, TaskError>>;

enum Command {
    Enqueue { task: NewTask, reply: Reply<Result<TaskHandle>> },
    Cancel { task_id: String, reply: Reply<bool> },
    ClearQueue { reply: Reply<usize> },
    Status { reply: Reply<SchedulerStatus> },
    RetryNow { reply: Reply<()> },
    TokenExhausted { service_id: String, context: Value, reply: Reply<Result<()>> },
    Shutdown { reply: Reply<()> },
}

enum Internal {
    ProbeCompleted(ProbeOutcome),
    TaskFinished {
        dispatch_seq: u64,
        outcome: std::result::Result<Value, TaskError>,
    },
}

/// Cloneable handle for producers.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ResumrError::SchedulerStopped)?;
        rx.await.map_err(|_| ResumrError::SchedulerStopped)
    }

    /// Queue a task. Fails with `UnknownService` for unregistered services.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskHandle> {
        self.request(|reply| Command::Enqueue { task, reply }).await?
    }

    /// Cancel a pending, retrying, or running task. False if not live.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        self.request(|reply| Command::Cancel { task_id, reply }).await
    }

    /// Drop every pending, retrying, and running task. Returns how many were dropped.
    pub async fn clear_queue(&self) -> Result<usize> {
        self.request(|reply| Command::ClearQueue { reply }).await
    }

    pub async fn status(&self) -> Result<SchedulerStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Reprobe every service now and run a scheduling pass.
    pub async fn retry_now(&self) -> Result<()> {
        self.request(|reply| Command::RetryNow { reply }).await
    }

    /// Report that `service_id` ran out of quota.
    ///
    /// Its running task (if any) goes back to the head of its bucket with
    /// `context` merged in. A numeric `reset_time` in `context` is used as
    /// the reset hint.
    pub async fn on_token_exhausted(&self, service_id: &str, context: Value) -> Result<()> {
        let service_id = service_id.to_string();
        self.request(|reply| Command::TokenExhausted {
            service_id,
            context,
            reply,
        })
        .await?
    }
}

pub struct SchedulerBuilder {
    settings: SchedulerSettings,
    prober: Prober,
    handlers: HandlerRegistry,
    persistence: Option<Persistence>,
    bus: Arc<dyn EventBus>,
}

impl SchedulerBuilder {
    fn new(settings: SchedulerSettings) -> Self {
        Self {
            prober: Prober::new(settings.probe_timeout),
            settings,
            handlers: HandlerRegistry::new(),
            persistence: None,
            bus: Arc::new(BroadcastBus::default()),
        }
    }

    /// Register a service; its id is what tasks target.
    pub fn service(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.prober.register(provider);
        self
    }

    pub fn handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.register(kind, handler);
        self
    }

    /// Persist state here. Without a store the scheduler runs memory-only.
    pub fn store(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Restore persisted state, probe every service once, and start the actor.
    pub async fn start(self) -> Result<Scheduler> {
        let mut registry = ServiceRegistry::new();
        for provider in self.prober.providers() {
            registry.register(Service::new(provider.id(), provider.display_name()));
        }

        let mut core = SchedulerCore::new(registry, self.settings.retry);
        let mut memory_only = self.persistence.is_none();
        let now = now_ms();

        if let Some(persistence) = &self.persistence {
            match persistence.load_latest_snapshot(now) {
                Ok(Some(snapshot)) => {
                    let report = core.restore(snapshot, now);
                    info!(
                        queued = report.queued,
                        retrying = report.retrying,
                        dropped = report.dropped,
                        "Restored scheduler state"
                    );
                }
                Ok(None) => info!("No snapshot to restore, starting empty"),
                Err(e) => {
                    error!(error = %e, "Failed to load snapshot; continuing in memory-only mode");
                    memory_only = true;
                }
            }
        }

        let (tx, commands) = mpsc::channel(self.settings.command_buffer);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let bus = self.bus.clone();

        let mut actor = Actor {
            core,
            prober: self.prober,
            handlers: self.handlers,
            persistence: self.persistence,
            bus: self.bus,
            settings: self.settings,
            waiters: HashMap::new(),
            running: None,
            probing: HashSet::new(),
            commands,
            internal_tx,
            internal_rx,
            memory_only,
        };

        for outcome in actor.prober.check_all().await {
            actor.on_probe_completed(outcome);
        }
        actor.record_all_services();
        actor.persist();
        actor.dispatch();

        let join = tokio::spawn(actor.run());
        Ok(Scheduler {
            handle: SchedulerHandle { tx },
            bus,
            join,
        })
    }
}

/// A running scheduler. Dropping it without `shutdown` leaves the actor
/// running until every handle is gone.
pub struct Scheduler {
    handle: SchedulerHandle,
    bus: Arc<dyn EventBus>,
    join: JoinHandle<()>,
}

impl Scheduler {
    pub fn builder(settings: SchedulerSettings) -> SchedulerBuilder {
        SchedulerBuilder::new(settings)
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }

    /// Return the running task to the queue, persist, and stop the actor.
    pub async fn shutdown(self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.join
            .await
            .map_err(|e| ResumrError::InvalidState(format!("Scheduler task failed: {}", e)))
    }
}

struct RunningDispatch {
    dispatch_seq: u64,
    token: CancellationToken,
}

struct Actor {
    core: SchedulerCore,
    prober: Prober,
    handlers: HandlerRegistry,
    persistence: Option<Persistence>,
    bus: Arc<dyn EventBus>,
    settings: SchedulerSettings,
    waiters: HashMap<String, Vec<Waiter>>,
    running: Option<RunningDispatch>,
    /// Services with a probe in flight
    probing: HashSet<String>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    memory_only: bool,
}

impl Actor {
    async fn run(mut self) {
        // interval() panics on a zero period
        let probe_every = self.settings.probe_interval.max(Duration::from_millis(1));
        let mut probe_tick = tokio::time::interval_at(Instant::now() + probe_every, probe_every);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = tokio::time::interval(self.settings.cleanup_interval.max(Duration::from_millis(1)));
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let now = now_ms();
            let wake = self
                .core
                .next_wakeup(now)
                .map(|at| Instant::now() + Duration::from_millis((at - now).max(0) as u64));
            let timer = async move {
                match wake {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
                _ = probe_tick.tick() => self.probe_all(),
                _ = cleanup_tick.tick() => self.cleanup(),
                _ = timer => self.on_timer(),
            }

            self.dispatch();
        }
    }

    /// Returns false once the actor should stop.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue { task, reply } => {
                let _ = reply.send(self.enqueue(task));
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            Command::ClearQueue { reply } => {
                let _ = reply.send(self.clear_queue());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::RetryNow { reply } => {
                info!("Manual retry requested, reprobing all services");
                self.probe_all();
                let _ = reply.send(());
            }
            Command::TokenExhausted {
                service_id,
                context,
                reply,
            } => {
                let _ = reply.send(self.exhaust(&service_id, &context));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ProbeCompleted(outcome) => self.on_probe_completed(outcome),
            Internal::TaskFinished { dispatch_seq, outcome } => self.on_task_finished(dispatch_seq, outcome),
        }
    }

    fn enqueue(&mut self, request: NewTask) -> Result<TaskHandle> {
        let enqueued = self.core.enqueue(request, now_ms())?;
        let id = enqueued.task_id().to_string();

        let (tx, rx) = oneshot::channel();
        self.waiters.entry(id.clone()).or_default().push(tx);

        let attached = matches!(enqueued, Enqueued::Attached(_));
        if attached {
            debug!(task_id = %id, "Keyed request attached to live task");
        } else {
            info!(task_id = %id, queue_length = self.core.queue().len(), "Task enqueued");
        }
        self.persist();

        Ok(TaskHandle { id, attached, rx })
    }

    fn cancel(&mut self, task_id: &str) -> bool {
        let Some(cancelled) = self.core.cancel(task_id) else {
            return false;
        };
        if cancelled.was_running {
            self.stop_running();
        }
        info!(task_id = %task_id, was_running = cancelled.was_running, "Task cancelled");
        self.resolve(task_id, Err(TaskError::Cancelled));
        self.persist();
        true
    }

    fn clear_queue(&mut self) -> usize {
        let cleared = self.core.clear();
        if cleared.was_running {
            self.stop_running();
        }
        for task in &cleared.tasks {
            self.resolve(&task.id, Err(TaskError::Cancelled));
        }
        info!(cleared = cleared.tasks.len(), was_running = cleared.was_running, "Queue cleared");
        self.persist();
        cleared.tasks.len()
    }

    fn exhaust(&mut self, service_id: &str, context: &Value) -> Result<()> {
        let now = now_ms();
        let exhaustion = self.core.exhaust(service_id, context, now)?;
        if let Some(task_id) = &exhaustion.reclaimed {
            self.stop_running();
            info!(task_id = %task_id, service = %service_id, "Reclaimed running task after exhaustion signal");
        }
        warn!(service = %service_id, reset_time = ?exhaustion.reset_time, "Service reported exhausted");

        self.persist();
        self.record_service(service_id, now);
        self.publish_exhausted(service_id);
        self.probe(service_id);
        Ok(())
    }

    fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            services: self.core.registry().snapshot(),
            queue: self.core.queue().as_slice().to_vec(),
            current_task: self.core.current_task().cloned(),
            retrying: self.core.retries().entries().to_vec(),
            memory_only: self.memory_only,
        }
    }

    fn dispatch(&mut self) {
        let Some(Dispatch { task, dispatch_seq }) = self.core.next_dispatch(now_ms()) else {
            return;
        };
        info!(
            task_id = %task.id,
            service = %task.service_id,
            kind = %task.kind(),
            attempt = task.retry_count + 1,
            "Dispatching task"
        );

        let handler = self.handlers.get(&task.kind());
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let tx = self.internal_tx.clone();
        let timeout = self.settings.task_timeout;

        tokio::spawn(async move {
            let outcome = match handler {
                Some(handler) => tokio::select! {
                    _ = cancelled.cancelled() => return,
                    result = tokio::time::timeout(timeout, handler.execute(&task)) => result
                        .unwrap_or_else(|_| Err(TaskError::Transient(format!("Timed out after {:?}", timeout)))),
                },
                None => Err(TaskError::Fatal(format!("No handler registered for {}", task.kind()))),
            };
            let _ = tx.send(Internal::TaskFinished { dispatch_seq, outcome });
        });

        self.running = Some(RunningDispatch { dispatch_seq, token });
        self.persist();
    }

    fn on_task_finished(&mut self, dispatch_seq: u64, outcome: std::result::Result<Value, TaskError>) {
        if self.running.as_ref().is_some_and(|r| r.dispatch_seq == dispatch_seq) {
            self.running = None;
        }

        let now = now_ms();
        let Some(completion) = self.core.complete(dispatch_seq, outcome, now) else {
            debug!(dispatch_seq, "Ignoring completion of superseded dispatch");
            return;
        };

        match completion {
            Completion::Completed(task) => {
                info!(task_id = %task.id, service = %task.service_id, "Task completed");
                self.bus.publish(SchedulerEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    service_id: task.service_id.clone(),
                });
                let result = task.result.clone().unwrap_or(Value::Null);
                self.archive(&task, now);
                self.resolve(&task.id, Ok(result));
            }
            Completion::Failed { task, error } => {
                warn!(task_id = %task.id, service = %task.service_id, error = %error, "Task failed");
                self.bus.publish(SchedulerEvent::TaskFailed {
                    task_id: task.id.clone(),
                    service_id: task.service_id.clone(),
                    error: task.error.clone().unwrap_or_else(|| error.to_string()),
                });
                self.archive(&task, now);
                self.resolve(&task.id, Err(error));
            }
            Completion::Retrying {
                task_id,
                retry_count,
                delay,
            } => {
                info!(task_id = %task_id, retry_count, delay_ms = delay.as_millis() as u64, "Task scheduled for retry");
            }
            Completion::RateLimited {
                task_id,
                service_id,
                change,
            } => {
                warn!(task_id = %task_id, service = %service_id, "Rate limited, task returned to queue head");
                if let Some(change) = change {
                    self.record_service(&service_id, now);
                    self.publish_change(&change);
                }
            }
        }

        self.persist();
    }

    fn on_timer(&mut self) {
        let now = now_ms();
        let released = self.core.release_due_retries(now);
        if released > 0 {
            debug!(released, "Deferred retries re-entered the queue");
            self.persist();
        }
        for service_id in self.core.registry().due_for_reprobe(now) {
            debug!(service = %service_id, "Reset time passed, reprobing");
            self.probe(&service_id);
        }
    }

    fn probe_all(&mut self) {
        let ids: Vec<String> = self.core.registry().ids().map(String::from).collect();
        for id in ids {
            self.probe(&id);
        }
    }

    /// Start a background probe unless one is already in flight.
    fn probe(&mut self, service_id: &str) {
        if !self.probing.insert(service_id.to_string()) {
            return;
        }
        let tx = self.internal_tx.clone();
        let spawned = self.prober.spawn_probe(service_id, move |outcome| {
            let _ = tx.send(Internal::ProbeCompleted(outcome));
        });
        if !spawned {
            self.probing.remove(service_id);
        }
    }

    fn on_probe_completed(&mut self, outcome: ProbeOutcome) {
        self.probing.remove(&outcome.service_id);
        if let Err(e) = &outcome.result {
            warn!(service = %outcome.service_id, error = %e, "Probe failed");
        }

        if let Some(change) = self.core.apply_probe(&outcome) {
            info!(service = %change.service_id, from = %change.from, to = %change.to, "Service status changed");
            self.record_service(&change.service_id, outcome.checked_at);
            self.publish_change(&change);
            self.persist();
        }
    }

    fn publish_change(&self, change: &StatusChange) {
        if change.became_limited() {
            self.publish_exhausted(&change.service_id);
        } else if change.recovered() {
            let service_name = self
                .core
                .service(&change.service_id)
                .map(|s| s.display_name.clone())
                .unwrap_or_default();
            self.bus.publish(SchedulerEvent::ServiceRecovered {
                service_id: change.service_id.clone(),
                service_name,
            });
        }
    }

    fn publish_exhausted(&self, service_id: &str) {
        let Some(service) = self.core.service(service_id) else {
            return;
        };
        self.bus.publish(SchedulerEvent::Exhausted {
            service_id: service.id.clone(),
            service_name: service.display_name.clone(),
            reset_time: service.reset_time,
            queue_length: self.core.queue().len(),
        });
    }

    fn stop_running(&mut self) {
        if let Some(running) = self.running.take() {
            running.token.cancel();
        }
    }

    fn resolve(&mut self, task_id: &str, outcome: std::result::Result<Value, TaskError>) {
        for waiter in self.waiters.remove(task_id).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn shutdown(&mut self) {
        self.stop_running();
        if let Some(task_id) = self.core.requeue_current() {
            info!(task_id = %task_id, "Returned running task to the queue");
        }
        self.persist();
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(TaskError::Shutdown));
            }
        }
        info!(live_tasks = self.core.live_task_ids().len(), "Scheduler stopped");
    }

    // --- Persistence ---

    fn active_store(&self) -> Option<Persistence> {
        if self.memory_only {
            None
        } else {
            self.persistence.clone()
        }
    }

    fn degrade(&mut self, action: &str, err: ResumrError) {
        error!(error = %err, "Persistence failed to {}; continuing in memory-only mode", action);
        self.memory_only = true;
    }

    fn persist(&mut self) {
        let Some(store) = self.active_store() else {
            return;
        };
        let now = now_ms();
        let snapshot = self.core.snapshot(now);
        let result = store
            .replace_queue(self.core.queue().as_slice(), now)
            .and_then(|_| store.save_snapshot(&snapshot));
        if let Err(e) = result {
            self.degrade("save state", e);
        }
    }

    fn archive(&mut self, task: &Task, now: i64) {
        let Some(store) = self.active_store() else {
            return;
        };
        if let Err(e) = store.append_history(&HistoryRecord::new(task.clone(), now)) {
            self.degrade("archive task", e);
        }
    }

    fn record_service(&mut self, service_id: &str, now: i64) {
        let Some(store) = self.active_store() else {
            return;
        };
        let Some(service) = self.core.service(service_id).cloned() else {
            return;
        };
        if let Err(e) = store.record_service_states(&[service], now) {
            self.degrade("record service state", e);
        }
    }

    fn record_all_services(&mut self) {
        let Some(store) = self.active_store() else {
            return;
        };
        if let Err(e) = store.record_service_states(&self.core.registry().snapshot(), now_ms()) {
            self.degrade("record service state", e);
        }
    }

    fn cleanup(&mut self) {
        let Some(store) = self.active_store() else {
            return;
        };
        match store.cleanup(now_ms()) {
            Ok(report) => debug!(removed = report.total(), "Retention cleanup finished"),
            Err(e) => self.degrade("apply retention", e),
        }
    }
}
