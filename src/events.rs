//! Per-job event bus with ring-buffered replay.
//!
//! Each job owns one [`EventBus`]: an append-only log of `{id, name, data}`
//! records with strictly monotonic ids starting at 1, kept in a bounded ring
//! buffer (oldest evicted on overflow) and fanned out live to every
//! subscriber.
//!
//! Subscribers get their own unbounded channel rather than a shared
//! broadcast: a slow SSE consumer must never cause another subscriber to
//! miss events, and the per-job event volume is small (one record per page
//! plus a handful of lifecycle records). Reconnection replays the buffered
//! suffix after the client's `Last-Event-ID`; if that id has already been
//! evicted, replay starts from the oldest buffered record and the client is
//! expected to fall back to a status poll for the gap.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

/// One emitted event.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Monotonic id, starting at 1 per bus.
    pub id: u64,
    /// Event name, e.g. `page.completed`.
    pub name: String,
    /// JSON payload.
    pub data: Value,
}

/// Returned by [`EventBus::emit`] after the bus has been closed.
#[derive(Debug, thiserror::Error)]
#[error("event bus is closed")]
pub struct BusClosed;

struct BusInner {
    next_id: u64,
    capacity: usize,
    buffer: VecDeque<EventRecord>,
    subscribers: Vec<mpsc::UnboundedSender<EventRecord>>,
    closed: bool,
}

/// Per-job publish-subscribe log with bounded replay.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Create a bus whose ring buffer holds `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 1,
                capacity: capacity.max(1),
                buffer: VecDeque::with_capacity(capacity.max(1)),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Append an event and deliver it to every live subscriber.
    ///
    /// Returns the assigned id; the k-th emit returns k. Fails once the bus
    /// has been closed.
    pub fn emit(&self, name: &str, data: Value) -> Result<u64, BusClosed> {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        if inner.closed {
            return Err(BusClosed);
        }

        let record = EventRecord {
            id: inner.next_id,
            name: name.to_string(),
            data,
        };
        inner.next_id += 1;

        if inner.buffer.len() == inner.capacity {
            inner.buffer.pop_front();
        }
        inner.buffer.push_back(record.clone());

        // Prune subscribers whose receiving end has gone away.
        inner
            .subscribers
            .retain(|tx| tx.send(record.clone()).is_ok());

        Ok(record.id)
    }

    /// Subscribe, optionally resuming after a previously seen id.
    ///
    /// Returns the buffered records with `id > after_id` (all buffered when
    /// `after_id` is `None`) in ascending order, plus a live channel carrying
    /// every subsequent emit. On a closed bus the channel is already
    /// terminated, so consumers see the replay and then end-of-stream.
    pub fn subscribe(
        &self,
        after_id: Option<u64>,
    ) -> (Vec<EventRecord>, mpsc::UnboundedReceiver<EventRecord>) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");

        let replay: Vec<EventRecord> = inner
            .buffer
            .iter()
            .filter(|e| after_id.map_or(true, |last| e.id > last))
            .cloned()
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        // When closed, tx drops here and rx yields None immediately after
        // the replay is consumed.
        (replay, rx)
    }

    /// Terminate the bus: reject further emits and end every live channel.
    ///
    /// Idempotent. Later subscribes still replay the buffer.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("event bus lock poisoned").closed
    }

    /// Highest id emitted so far (0 before the first emit).
    pub fn last_id(&self) -> u64 {
        self.inner.lock().expect("event bus lock poisoned").next_id - 1
    }
}

/// Process-wide map of job id → event bus.
///
/// Explicit state passed into handlers rather than a module-level global;
/// constructed once at startup next to the registry.
pub struct EventHub {
    capacity: usize,
    buses: RwLock<HashMap<String, std::sync::Arc<EventBus>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buses: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, job_id: &str) -> Option<std::sync::Arc<EventBus>> {
        self.buses
            .read()
            .expect("event hub lock poisoned")
            .get(job_id)
            .cloned()
    }

    pub fn get_or_create(&self, job_id: &str) -> std::sync::Arc<EventBus> {
        let mut buses = self.buses.write().expect("event hub lock poisoned");
        buses
            .entry(job_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(EventBus::new(self.capacity)))
            .clone()
    }

    /// Swap in a fresh bus for a retried job, closing the old one.
    ///
    /// Subscribers of the old bus see end-of-stream; reconnecting clients
    /// receive only events from the new bus.
    pub fn replace(&self, job_id: &str) -> std::sync::Arc<EventBus> {
        let fresh = std::sync::Arc::new(EventBus::new(self.capacity));
        let old = self
            .buses
            .write()
            .expect("event hub lock poisoned")
            .insert(job_id.to_string(), fresh.clone());
        if let Some(old) = old {
            old.close();
        }
        fresh
    }

    /// Drop a job's bus entirely (cleanup), closing it first.
    pub fn remove(&self, job_id: &str) {
        let old = self
            .buses
            .write()
            .expect("event hub lock poisoned")
            .remove(job_id);
        if let Some(old) = old {
            old.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emit_assigns_monotonic_ids_from_one() {
        let bus = EventBus::new(10);
        for k in 1..=5u64 {
            let id = bus.emit("tick", json!({ "k": k })).unwrap();
            assert_eq!(id, k);
        }
    }

    #[test]
    fn subscribe_replays_after_id() {
        let bus = EventBus::new(10);
        for _ in 0..4 {
            bus.emit("tick", json!({})).unwrap();
        }
        let (replay, _rx) = bus.subscribe(Some(2));
        let ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);

        let (all, _rx) = bus.subscribe(None);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let bus = EventBus::new(3);
        for _ in 0..5 {
            bus.emit("tick", json!({})).unwrap();
        }
        // Ids 1 and 2 have been evicted; resume-from-0 starts at the oldest
        // buffered record.
        let (replay, _rx) = bus.subscribe(Some(0));
        let ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn live_subscriber_sees_every_emit_in_order() {
        let bus = EventBus::new(10);
        bus.emit("early", json!({})).unwrap();

        let (replay, mut rx) = bus.subscribe(None);
        assert_eq!(replay.len(), 1);

        bus.emit("a", json!({})).unwrap();
        bus.emit("b", json!({})).unwrap();
        bus.close();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.id, first.name.as_str()), (2, "a"));
        assert_eq!((second.id, second.name.as_str()), (3, "b"));
        assert!(rx.recv().await.is_none(), "closed bus must end the channel");
    }

    #[tokio::test]
    async fn closed_bus_rejects_emit_but_still_replays() {
        let bus = EventBus::new(10);
        bus.emit("only", json!({})).unwrap();
        bus.close();

        assert!(bus.emit("late", json!({})).is_err());

        let (replay, mut rx) = bus.subscribe(None);
        assert_eq!(replay.len(), 1);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn replay_plus_live_never_duplicates() {
        let bus = EventBus::new(10);
        bus.emit("a", json!({})).unwrap();
        let (replay, mut rx) = bus.subscribe(None);
        bus.emit("b", json!({})).unwrap();

        let replay_ids: Vec<u64> = replay.iter().map(|e| e.id).collect();
        assert_eq!(replay_ids, vec![1]);
        let live = rx.try_recv().unwrap();
        assert_eq!(live.id, 2);
        assert!(rx.try_recv().is_err(), "no duplicate of the replayed event");
    }

    #[test]
    fn hub_replace_closes_old_bus() {
        let hub = EventHub::new(10);
        let old = hub.get_or_create("j1");
        old.emit("x", json!({})).unwrap();

        let fresh = hub.replace("j1");
        assert!(old.is_closed());
        assert!(!fresh.is_closed());
        assert_eq!(fresh.last_id(), 0, "fresh bus restarts ids");
        assert!(std::sync::Arc::ptr_eq(&hub.get("j1").unwrap(), &fresh));
    }
}
