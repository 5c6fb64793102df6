//! Scheduler events and the bus that carries them.
//!
//! [`BroadcastBus`] is a thin wrapper around [`tokio::sync::broadcast`].
//! Publishing never blocks and is a no-op when nobody is subscribed.

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Default channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A service ran out of capacity, detected by a probe or reported by a caller
    Exhausted {
        service_id: String,
        service_name: String,
        reset_time: Option<i64>,
        /// Live tasks waiting when the event fired
        queue_length: usize,
    },
    ServiceRecovered {
        service_id: String,
        service_name: String,
    },
    TaskCompleted {
        task_id: String,
        service_id: String,
    },
    TaskFailed {
        task_id: String,
        service_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Exhausted,
    ServiceRecovered,
    TaskCompleted,
    TaskFailed,
}

impl SchedulerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::Exhausted { .. } => EventKind::Exhausted,
            SchedulerEvent::ServiceRecovered { .. } => EventKind::ServiceRecovered,
            SchedulerEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            SchedulerEvent::TaskFailed { .. } => EventKind::TaskFailed,
        }
    }
}

/// Callback registered with [`EventBus::on`].
pub type EventHandler = Box<dyn Fn(SchedulerEvent) + Send + Sync>;

pub trait EventBus: Send + Sync {
    fn publish(&self, event: SchedulerEvent);

    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent>;

    /// Run `handler` for every future event of `kind`.
    ///
    /// Spawns a listener task; abort the returned handle to unregister.
    /// Must be called from within a tokio runtime.
    fn on(&self, kind: EventKind, handler: EventHandler) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => handler(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event listener for {:?} lagged, skipped {} events", kind, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}
