//! In-process event bus backed by tokio channels.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use formplug_core::EventType;

use crate::Event;
use crate::bus::{BusError, EventBus, EventListener};

type Listeners = Arc<RwLock<Vec<(EventType, Arc<dyn EventListener>)>>>;

struct Group {
    name: String,
    listeners: Listeners,
    tx: mpsc::UnboundedSender<Event>,
}

/// Count of events queued or being handled across all groups.
#[derive(Default)]
struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn settle_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

#[derive(Default)]
struct BusState {
    groups: Vec<Group>,
    closed: bool,
}

/// In-memory pub/sub bus.
///
/// - One unbounded queue and one consumer task per listener group
/// - Listener failures are contained to the listener
/// - `flush` waits for the queues to empty without closing the bus
/// - `shutdown` drains every queue before returning
///
/// Groups are started lazily on first `subscribe`, which must happen inside a
/// tokio runtime.
pub struct InMemoryEventBus {
    state: Mutex<BusState>,
    backlog: Arc<Backlog>,
    tracker: TaskTracker,
}

impl core::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let groups = self
            .state
            .lock()
            .map(|s| s.groups.iter().map(|g| g.name.clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("InMemoryEventBus")
            .field("groups", &groups)
            .finish()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Wait until every event published so far, and every event those
    /// listeners publish in turn, has been handled. The bus stays open.
    pub async fn flush(&self) {
        loop {
            let idle = self.backlog.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.backlog.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Events queued or in progress across all groups.
    pub fn backlog(&self) -> usize {
        self.backlog.pending.load(Ordering::Acquire)
    }

    /// Stop accepting events and wait until every queued event has been
    /// handed to its listeners.
    pub async fn shutdown(&self) {
        let groups = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.groups)
            }
            Err(_) => Vec::new(),
        };
        let count = groups.len();
        // Dropping the senders lets each consumer finish its backlog and exit.
        drop(groups);

        self.tracker.close();
        self.tracker.wait().await;
        debug!(groups = count, "event bus drained");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            backlog: Arc::new(Backlog::default()),
            tracker: TaskTracker::new(),
        }
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: Event) -> Result<(), BusError> {
        let state = self.state.lock().map_err(|_| BusError::Poisoned)?;
        if state.closed {
            return Err(BusError::Closed);
        }

        let ty = event.event_type();
        for group in &state.groups {
            let interested = group
                .listeners
                .read()
                .map(|ls| ls.iter().any(|(t, _)| *t == ty))
                .unwrap_or(false);
            if !interested {
                continue;
            }
            self.backlog.pending.fetch_add(1, Ordering::AcqRel);
            if group.tx.send(event.clone()).is_err() {
                self.backlog.settle_one();
                warn!(group = %group.name, event_type = %ty, "listener group is gone; event dropped");
            }
        }

        Ok(())
    }

    fn subscribe(
        &self,
        group: &str,
        event_type: EventType,
        listener: Arc<dyn EventListener>,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().map_err(|_| BusError::Poisoned)?;
        if state.closed {
            return Err(BusError::Closed);
        }

        if let Some(existing) = state.groups.iter().find(|g| g.name == group) {
            existing
                .listeners
                .write()
                .map_err(|_| BusError::Poisoned)?
                .push((event_type, listener));
            return Ok(());
        }

        let listeners: Listeners = Arc::new(RwLock::new(vec![(event_type, listener)]));
        let (tx, rx) = mpsc::unbounded_channel();
        self.tracker
            .spawn(group_loop(group.to_string(), listeners.clone(), rx, self.backlog.clone()));

        state.groups.push(Group {
            name: group.to_string(),
            listeners,
            tx,
        });
        Ok(())
    }
}

async fn group_loop(
    name: String,
    listeners: Listeners,
    mut rx: mpsc::UnboundedReceiver<Event>,
    backlog: Arc<Backlog>,
) {
    while let Some(event) = rx.recv().await {
        deliver(&name, &listeners, &event).await;
        backlog.settle_one();
    }
}

async fn deliver(name: &str, listeners: &Listeners, event: &Event) {
    let ty = event.event_type();
    let matching: Vec<Arc<dyn EventListener>> = match listeners.read() {
        Ok(ls) => ls
            .iter()
            .filter(|(t, _)| *t == ty)
            .map(|(_, l)| l.clone())
            .collect(),
        Err(_) => {
            error!(group = %name, "listener registry poisoned");
            return;
        }
    };

    for listener in matching {
        match AssertUnwindSafe(listener.on_event(event))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(group = %name, event_type = %ty, error = %err, "event listener failed");
            }
            Err(_) => {
                error!(group = %name, event_type = %ty, "event listener panicked");
            }
        }
    }
}
