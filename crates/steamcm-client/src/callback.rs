//! Callback dispatcher: a FIFO queue of events drained by the consumer.
//!
//! The connection worker and message handlers `post` events; the application pumps them
//! with [`CallbackManager::run_one`] or [`CallbackManager::run`] from its own thread.
//! Each event goes to every subscriber of its concrete type, in subscription order. The
//! subscriber list is snapshotted per event, so unsubscribing during delivery only
//! affects later events.

use std::any::{type_name, Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{BoxError, DispatchError, FailureKind, HandlerFailure};

type SubscriberFn = Arc<dyn Fn(&(dyn Any + Send)) -> std::result::Result<(), BoxError> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: SubscriberFn,
}

struct QueuedEvent {
    type_id: TypeId,
    type_name: &'static str,
    event: Box<dyn Any + Send>,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<VecDeque<QueuedEvent>>,
    available: Condvar,
    subscribers: Mutex<HashMap<TypeId, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Shared {
    fn remove(&self, type_id: TypeId, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(&type_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&type_id);
        }
        removed
    }
}

/// Thread-safe event queue with typed subscriptions.
#[derive(Clone, Default)]
pub struct CallbackManager {
    shared: Arc<Shared>,
}

impl CallbackManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `f` to events of type `T`.
    pub fn subscribe<T, F>(&self, f: F) -> Subscription
    where
        T: Any + Send,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.try_subscribe::<T, _, std::convert::Infallible>(move |event| {
            f(event);
            Ok(())
        })
    }

    /// Subscribes a fallible `f` to events of type `T`. Errors are reported to the pump.
    pub fn try_subscribe<T, F, E>(&self, f: F) -> Subscription
    where
        T: Any + Send,
        F: Fn(&T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let callback: SubscriberFn = Arc::new(move |event: &(dyn Any + Send)| {
            match event.downcast_ref::<T>() {
                Some(event) => f(event).map_err(Into::into),
                None => Ok(()),
            }
        });
        let type_id = TypeId::of::<T>();
        self.shared
            .subscribers
            .lock()
            .entry(type_id)
            .or_default()
            .push(Subscriber { id, callback });
        debug!(event = type_name::<T>(), subscription = id, "subscribed");
        Subscription {
            id,
            type_id,
            shared: Arc::downgrade(&self.shared),
            active: true,
        }
    }

    /// Queues an event. Never blocks on the pump.
    pub fn post<T: Any + Send>(&self, event: T) {
        self.shared.queue.lock().push_back(QueuedEvent {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            event: Box::new(event),
        });
        self.shared.available.notify_one();
    }

    /// Number of queued events.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Number of live subscriptions for `T`.
    pub fn subscriber_count<T: Any>(&self) -> usize {
        self.shared
            .subscribers
            .lock()
            .get(&TypeId::of::<T>())
            .map_or(0, Vec::len)
    }

    /// Delivers one event, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `Ok(false)` if nothing arrived. If any subscriber failed, the error lists
    /// every failure for that event; the event still counts as processed.
    pub fn run_one(&self, timeout: Duration) -> std::result::Result<bool, DispatchError> {
        let deadline = Instant::now() + timeout;
        let event = {
            let mut queue = self.shared.queue.lock();
            loop {
                if let Some(event) = queue.pop_front() {
                    break event;
                }
                if self.shared.available.wait_until(&mut queue, deadline).timed_out() {
                    match queue.pop_front() {
                        Some(event) => break event,
                        None => return Ok(false),
                    }
                }
            }
        };
        self.deliver(event)?;
        Ok(true)
    }

    /// Delivers events until `timeout` elapses. A failing subscriber does not stop the
    /// pump: later events are still delivered, and the first dispatch failure is returned
    /// once the deadline passes. Later failures are only logged.
    pub fn run(&self, timeout: Duration) -> std::result::Result<usize, DispatchError> {
        let deadline = Instant::now() + timeout;
        let mut delivered = 0;
        let mut first_failure = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.run_one(remaining) {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => {
                    delivered += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Delivers everything queued right now without waiting. Like [`CallbackManager::run`],
    /// the queue is drained even when a subscriber fails.
    pub fn run_pending(&self) -> std::result::Result<usize, DispatchError> {
        let mut delivered = 0;
        let mut first_failure = None;
        loop {
            match self.run_one(Duration::ZERO) {
                Ok(true) => delivered += 1,
                Ok(false) => break,
                Err(e) => {
                    delivered += 1;
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    fn deliver(&self, queued: QueuedEvent) -> std::result::Result<(), DispatchError> {
        let snapshot: Vec<Subscriber> = self
            .shared
            .subscribers
            .lock()
            .get(&queued.type_id)
            .cloned()
            .unwrap_or_default();
        if snapshot.is_empty() {
            debug!(event = queued.type_name, "no subscribers for event");
            return Ok(());
        }

        let mut failures = Vec::new();
        for subscriber in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(queued.event.as_ref())));
            let kind = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => FailureKind::Error(e.to_string()),
                Err(payload) => FailureKind::Panic(panic_message(payload.as_ref())),
            };
            warn!(event = queued.type_name, subscription = subscriber.id, failure = %kind, "subscriber failed");
            failures.push(HandlerFailure {
                subscription: subscriber.id,
                kind,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DispatchError {
                event: queued.type_name,
                failures,
            })
        }
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("pending", &self.pending())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A live subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    type_id: TypeId,
    shared: Weak<Shared>,
    active: bool,
}

impl Subscription {
    /// Id reported in [`HandlerFailure`]s.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribes now. Returns false if the manager is gone.
    pub fn unsubscribe(mut self) -> bool {
        self.release()
    }

    /// Keeps the subscription for the manager's whole lifetime.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        match self.shared.upgrade() {
            Some(shared) => shared.remove(self.type_id, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
