//! Post-commit event bus with per-player ordering.
//!
//! Delivery contract: asynchronous, at-least-once, ordered per player.
//! Producers stage events inside their transaction and hand them to the bus
//! only after the commit returns, so an event is never visible for a
//! rolled-back write. Different players fan out across a bounded worker
//! pool; one player's queue is drained by at most one worker at a time, so
//! a subscriber sees that player's `seq` values strictly ascending.
//!
//! Subscriber errors are logged and swallowed: they affect neither other
//! subscribers nor subsequent deliveries, and the producing transaction is
//! already durable by the time a subscriber runs.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const EVENT_VERSION: u32 = 1;

/// A committed balance mutation for one player. `seq` is the monotonic
/// per-player counter stamped by the producer inside its transaction.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BalanceChanged {
    pub uuid: Uuid,
    pub seq: u64,
    pub old_units: i64,
    pub new_units: i64,
    pub reason: String,
    pub version: u32,
}

/// Subscribers must be idempotent: delivery is at-least-once. Handlers run
/// on bus worker tasks; anything needing main-thread context posts back via
/// the host runtime's execute hook.
pub trait Subscriber: Send + Sync {
    fn name(&self) -> &str;
    fn on_balance_changed(&self, event: &BalanceChanged) -> anyhow::Result<()>;
}

struct PlayerQueue {
    events: VecDeque<BalanceChanged>,
    /// A worker currently owns this queue. At most one at a time.
    claimed: bool,
}

struct Inner {
    queues: Mutex<HashMap<Uuid, PlayerQueue>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
    workers: Arc<Semaphore>,
    draining: AtomicBool,
    active_workers: AtomicUsize,
}

/// Handle to the bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// `worker_count` bounds how many player queues drain concurrently.
    pub fn new(worker_count: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                subscribers: RwLock::new(Vec::new()),
                workers: Arc::new(Semaphore::new(worker_count.max(1))),
                draining: AtomicBool::new(false),
                active_workers: AtomicUsize::new(0),
            }),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner());
        subs.push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Enqueue one committed event. Returns `false` (and drops the event)
    /// when the bus is draining.
    pub fn publish(&self, event: BalanceChanged) -> bool {
        if self.inner.draining.load(Ordering::Acquire) {
            tracing::warn!(player = %event.uuid, seq = event.seq, "bus draining, event dropped");
            return false;
        }

        let player = event.uuid;
        let claim = {
            let mut queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let queue = queues.entry(player).or_insert_with(|| PlayerQueue {
                events: VecDeque::new(),
                claimed: false,
            });
            queue.events.push_back(event);
            if queue.claimed {
                false
            } else {
                queue.claimed = true;
                true
            }
        };

        if claim {
            self.spawn_worker(player);
        }
        true
    }

    /// Publish a committed batch in order. Used by producers whose
    /// transaction touched several players.
    pub fn publish_all(&self, events: impl IntoIterator<Item = BalanceChanged>) -> usize {
        events
            .into_iter()
            .map(|ev| self.publish(ev) as usize)
            .sum()
    }

    fn spawn_worker(&self, player: Uuid) {
        let inner = Arc::clone(&self.inner);
        inner.active_workers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            // The claim above reserved the queue; the permit bounds how many
            // claimed queues drain at once.
            let permit = inner.workers.clone().acquire_owned().await;
            if permit.is_ok() {
                loop {
                    let event = {
                        let mut queues = inner.queues.lock().unwrap_or_else(|p| p.into_inner());
                        match queues.get_mut(&player) {
                            Some(queue) => match queue.events.pop_front() {
                                Some(ev) => Some(ev),
                                None => {
                                    // Drained: release the claim while still
                                    // holding the registry lock, so a racing
                                    // publish either sees the claim or spawns
                                    // a fresh worker, never neither.
                                    queues.remove(&player);
                                    None
                                }
                            },
                            None => None,
                        }
                    };
                    let Some(event) = event else { break };
                    deliver(&inner, &event);
                }
            }
            inner.active_workers.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Mark the bus draining, finish per-player queues in arrival order,
    /// then return. No new events are accepted once this starts.
    pub async fn shutdown(&self) {
        self.inner.draining.store(true, Ordering::Release);
        loop {
            let busy = self.inner.active_workers.load(Ordering::Acquire) > 0 || {
                let queues = self.inner.queues.lock().unwrap_or_else(|p| p.into_inner());
                !queues.is_empty()
            };
            if !busy {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Number of events queued but not yet delivered.
    pub fn backlog(&self) -> usize {
        let queues = self.inner.queues.lock().unwrap_or_else(|p| p.into_inner());
        queues.values().map(|q| q.events.len()).sum()
    }
}

fn deliver(inner: &Inner, event: &BalanceChanged) {
    let subscribers: Vec<Arc<dyn Subscriber>> = {
        let subs = inner.subscribers.read().unwrap_or_else(|p| p.into_inner());
        subs.clone()
    };
    for sub in subscribers {
        if let Err(e) = sub.on_balance_changed(event) {
            tracing::warn!(
                subscriber = sub.name(),
                player = %event.uuid,
                seq = event.seq,
                error = %e,
                "subscriber failed, event delivery continues"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct Recorder {
        name: String,
        seen: StdMutex<Vec<(Uuid, u64)>>,
        fail_on_seq: Option<u64>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: StdMutex::new(Vec::new()),
                fail_on_seq: None,
            })
        }
    }

    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_balance_changed(&self, event: &BalanceChanged) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push((event.uuid, event.seq));
            if self.fail_on_seq == Some(event.seq) {
                anyhow::bail!("induced failure");
            }
            Ok(())
        }
    }

    fn ev(uuid: Uuid, seq: u64) -> BalanceChanged {
        BalanceChanged {
            uuid,
            seq,
            old_units: (seq as i64) - 1,
            new_units: seq as i64,
            reason: "test".to_string(),
            version: EVENT_VERSION,
        }
    }

    async fn drain(bus: &EventBus) {
        // Drain without marking the bus as shut down for further asserts.
        for _ in 0..200 {
            if bus.backlog() == 0 && bus.inner.active_workers.load(Ordering::Acquire) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bus did not drain");
    }

    #[tokio::test]
    async fn per_player_order_is_preserved_across_interleaving() {
        let bus = EventBus::new(4);
        let rec = Recorder::new("order");
        bus.subscribe(rec.clone());

        let p1 = Uuid::from_u128(1);
        let p2 = Uuid::from_u128(2);
        for seq in 1..=10u64 {
            bus.publish(ev(p1, seq));
            bus.publish(ev(p2, seq));
        }
        drain(&bus).await;

        let seen = rec.seen.lock().unwrap();
        let p1_seqs: Vec<u64> = seen.iter().filter(|(u, _)| *u == p1).map(|(_, s)| *s).collect();
        let p2_seqs: Vec<u64> = seen.iter().filter(|(u, _)| *u == p2).map(|(_, s)| *s).collect();
        assert_eq!(p1_seqs, (1..=10).collect::<Vec<_>>());
        assert_eq!(p2_seqs, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn subscriber_errors_do_not_stop_delivery() {
        let bus = EventBus::new(2);
        let flaky = Arc::new(Recorder {
            name: "flaky".to_string(),
            seen: StdMutex::new(Vec::new()),
            fail_on_seq: Some(2),
        });
        let steady = Recorder::new("steady");
        bus.subscribe(flaky.clone());
        bus.subscribe(steady.clone());

        let p = Uuid::from_u128(7);
        for seq in 1..=4u64 {
            bus.publish(ev(p, seq));
        }
        drain(&bus).await;

        assert_eq!(flaky.seen.lock().unwrap().len(), 4);
        assert_eq!(steady.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn draining_bus_rejects_new_events() {
        let bus = EventBus::new(2);
        let rec = Recorder::new("drain");
        bus.subscribe(rec.clone());

        let p = Uuid::from_u128(9);
        bus.publish(ev(p, 1));
        bus.shutdown().await;

        assert!(!bus.publish(ev(p, 2)), "draining bus must refuse events");
        assert_eq!(rec.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_pool_is_bounded_but_all_players_drain() {
        let bus = EventBus::new(1);
        let rec = Recorder::new("bounded");
        bus.subscribe(rec.clone());

        for i in 0..20u128 {
            bus.publish(ev(Uuid::from_u128(i + 100), 1));
        }
        drain(&bus).await;
        assert_eq!(rec.seen.lock().unwrap().len(), 20);
    }
}
