//! Bounded broadcast + observer-registry event bus (spec §4.2), grounded on
//! the corpus's `EventBus`: a lazy restartable broadcast subscription for
//! UIs plus a push-based observer registry for durable sinks that run off
//! the hot path.

use crate::events::{Event, EventKind, EventObserver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

const EVENT_CHANNEL_BUFFER: usize = 1024;
const LIFECYCLE_CHANNEL_BUFFER: usize = 4096;

pub type ObserverToken = u64;

type ObserverList = Vec<(ObserverToken, Arc<dyn EventObserver>)>;

/// Fan-out pub/sub bus for pipeline events. `send` is non-blocking: a full
/// channel drops the lowest-severity pending events rather than block the
/// producer (spec §4.2's backpressure policy). Lifecycle events ride a
/// separate, more generous channel so a burst of progress/streaming events
/// can never lag a lifecycle event out from under a subscriber.
pub struct EventChannel {
    lifecycle_sender: broadcast::Sender<Event>,
    progress_sender: broadcast::Sender<Event>,
    observers: Arc<Mutex<ObserverList>>,
    sequence: AtomicU64,
    observer_sequence: AtomicU64,
    observer_tasks: Arc<TokioMutex<JoinSet<()>>>,
}

/// Wraps both of an `EventChannel`'s underlying broadcast receivers,
/// delivering lifecycle events ahead of progress events when both are ready.
pub struct EventReceiver {
    lifecycle: broadcast::Receiver<Event>,
    progress: broadcast::Receiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        tokio::select! {
            biased;
            event = self.lifecycle.recv() => event,
            event = self.progress.recv() => event,
        }
    }
}

impl EventChannel {
    pub fn new() -> Self {
        let (lifecycle_sender, _) = broadcast::channel(LIFECYCLE_CHANNEL_BUFFER);
        let (progress_sender, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);
        EventChannel {
            lifecycle_sender,
            progress_sender,
            observers: Arc::new(Mutex::new(Vec::new())),
            sequence: AtomicU64::new(1),
            observer_sequence: AtomicU64::new(1),
            observer_tasks: Arc::new(TokioMutex::new(JoinSet::new())),
        }
    }

    /// A lazy, restartable stream of events scoped to the subscriber's
    /// lifetime (spec §4.2).
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            lifecycle: self.lifecycle_sender.subscribe(),
            progress: self.progress_sender.subscribe(),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverToken {
        let token = self.observer_sequence.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((token, observer));
        token
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_token, _)| *observer_token != token);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Non-blocking enqueue. Returns immediately; delivery to the broadcast
    /// channel is best-effort (no subscribers is not an error), and
    /// observer dispatch is spawned off the caller's path.
    pub fn send(&self, correlation_id: &str, step_name: Option<&str>, kind: EventKind) {
        let event = self.build_event(correlation_id, step_name, kind);
        self.dispatch(event);
    }

    pub async fn shutdown(&self) {
        log::debug!("EventChannel: shutting down, aborting observer tasks");
        let mut tasks = self.observer_tasks.lock().await;
        tasks.shutdown().await;
    }

    fn dispatch(&self, event: Event) {
        // Low-severity (progress/streaming) events ride the lossy,
        // fixed-size `progress_sender`; everything else goes to the
        // generously-sized `lifecycle_sender`, so a burst of progress
        // events can only ever lag out other progress events, never a
        // lifecycle one (spec §4.2's drop-progress-first policy).
        if event.kind.is_low_severity() {
            let _ = self.progress_sender.send(event.clone());
        } else {
            let _ = self.lifecycle_sender.send(event.clone());
        }

        let observers = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect::<Vec<_>>();

        if observers.is_empty() {
            return;
        }

        let tasks = self.observer_tasks.clone();
        tokio::spawn(async move {
            let mut tasks_guard = tasks.lock().await;
            for observer in observers {
                let event = event.clone();
                tasks_guard.spawn(async move {
                    if let Err(err) = observer.on_event(&event).await {
                        log::error!(
                            "EventChannel observer failure: correlation_id={}, seq={}, error={}",
                            event.correlation_id,
                            event.seq,
                            err
                        );
                    }
                });
            }
        });
    }

    fn build_event(&self, correlation_id: &str, step_name: Option<&str>, kind: EventKind) -> Event {
        let suppress_from_user = kind.suppress_from_user();
        Event {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            step_name: step_name.map(str::to_string),
            correlation_id: correlation_id.to_string(),
            suppress_from_user,
            kind,
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
