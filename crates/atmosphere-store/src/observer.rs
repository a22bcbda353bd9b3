use atmosphere_types::{ObserverEvent, OBSERVER_QUEUE_CAPACITY};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Queue {
    events: Mutex<VecDeque<ObserverEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

struct Slot {
    collection: String,
    queue: Arc<Queue>,
}

/// Observers registered by id, held in a copy-on-write map so emitting an
/// event never takes the store's own read/write lock (design note: "Observer
/// fan-out without leaks").
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    slots: RwLock<HashMap<u64, Slot>>,
}

impl ObserverRegistry {
    /// Registers an observer of `collection`; the bounded queue holds
    /// `OBSERVER_QUEUE_CAPACITY` events and, once full, drops the oldest one
    /// to make room for the newest arrival (§5).
    pub fn register(&self, collection: impl Into<String>) -> (ObserverId, ObserverReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::with_capacity(OBSERVER_QUEUE_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.slots.write().insert(id, Slot { collection: collection.into(), queue: queue.clone() });
        (ObserverId(id), ObserverReceiver { queue })
    }

    pub fn remove(&self, id: ObserverId) {
        if let Some(slot) = self.slots.write().remove(&id.0) {
            slot.queue.closed.store(true, Ordering::SeqCst);
            slot.queue.notify.notify_waiters();
        }
    }

    /// Fans an event out to every observer of its collection. A queue already
    /// at `OBSERVER_QUEUE_CAPACITY` drops its oldest entry to make room --
    /// the newest event always gets through, per the bounded-queue policy in §5.
    pub fn emit(&self, event: ObserverEvent) {
        let slots = self.slots.read();
        for slot in slots.values() {
            if slot.collection == event.collection {
                let mut events = slot.queue.events.lock();
                if events.len() >= OBSERVER_QUEUE_CAPACITY {
                    events.pop_front();
                    tracing::warn!(collection = %event.collection, "observer queue full, dropping oldest event");
                }
                events.push_back(event.clone());
                drop(events);
                slot.queue.notify.notify_one();
            }
        }
    }
}

/// The receiving half of a registered observer. `recv` mirrors
/// `mpsc::Receiver::recv`: it returns `None` once the observer has been
/// removed and its queue drained.
pub struct ObserverReceiver {
    queue: Arc<Queue>,
}

impl ObserverReceiver {
    pub async fn recv(&mut self) -> Option<ObserverEvent> {
        loop {
            if let Some(event) = self.queue.events.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_types::ChangeKind;

    fn event(collection: &str, id: &str) -> ObserverEvent {
        ObserverEvent { collection: collection.into(), id: id.into(), kind: ChangeKind::Insert, origin: None }
    }

    #[tokio::test]
    async fn registered_observer_receives_matching_events() {
        let registry = ObserverRegistry::default();
        let (_id, mut rx) = registry.register("demo");
        registry.emit(event("demo", "x"));
        registry.emit(event("other", "y"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "x");
        assert!(tokio::time::timeout(std::time::Duration::from_millis(10), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn removed_observer_stops_receiving() {
        let registry = ObserverRegistry::default();
        let (id, mut rx) = registry.register("demo");
        registry.remove(id);
        registry.emit(event("demo", "x"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_the_oldest_event_not_the_newest() {
        let registry = ObserverRegistry::default();
        let (_id, mut rx) = registry.register("demo");
        for i in 0..OBSERVER_QUEUE_CAPACITY + 1 {
            registry.emit(event("demo", &i.to_string()));
        }
        let first_received = rx.recv().await.unwrap();
        assert_eq!(first_received.id, "1", "event 0 was the oldest and should have been dropped to make room for event {OBSERVER_QUEUE_CAPACITY}");
    }
}
