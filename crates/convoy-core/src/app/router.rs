//! MessageRouter: typed event fan-out between the coordinator, the monitor and workers.
//!
//! - Every published event gets a global sequence number.
//! - Publishing for one task holds that task's lane for the whole fan-out, so any single
//!   subscriber sees one task's events in emission order. Different tasks share no lock
//!   beyond the brief per-subscriber one.
//! - Publishing never blocks. When a subscriber's queue is full the event goes to that
//!   subscriber's backlog, and while a backlog exists later events queue behind it.
//!   `flush` (driven by `PublisherLoop`) moves backlogs forward.
//! - A backlog is bounded. A subscriber that lets it reach the limit is dropped and
//!   its receiver sees the end of the stream.
//! - Acked subscriptions keep each delivery in flight until `ack`; `redeliver_expired`
//!   sends unacknowledged deliveries again. Delivery is at-least-once and consumers
//!   are expected to be idempotent (the `seq` lets them spot repeats).
//! - Coordinator `assign`/`cancel` events addressed to a worker that has no
//!   subscription yet wait in that worker's mailbox and are handed to the first
//!   subscription that asks for them.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_MAX_BACKLOG;
use crate::domain::{AssignmentId, Event, EventKind, EventSource, TaskId, WorkerId};
use crate::ports::Clock;

const LANES: usize = 64;

pub type SubscriberId = u64;

/// Which events a subscriber wants. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Option<BTreeSet<EventKind>>,
    task: Option<TaskId>,
    worker: Option<WorkerId>,
    excluded_sources: BTreeSet<EventSource>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = EventKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn for_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn for_worker(mut self, worker: WorkerId) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn excluding_source(mut self, source: EventSource) -> Self {
        self.excluded_sources.insert(source);
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        self.kinds.as_ref().is_none_or(|k| k.contains(&event.kind))
            && self.task.as_ref().is_none_or(|t| t == &event.task_id)
            && self
                .worker
                .as_ref()
                .is_none_or(|w| event.worker_id.as_ref() == Some(w))
            && !self.excluded_sources.contains(&event.source)
    }
}

/// One event as handed to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// 1 on first delivery, incremented on each redelivery.
    pub attempt: u32,
    pub event: Event,
}

impl Delivery {
    pub fn seq(&self) -> u64 {
        self.event.seq
    }
}

#[derive(Debug)]
struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<Delivery>,
    backlog: VecDeque<Delivery>,
    acked: bool,
    /// seq -> (delivery, when it was last handed to the channel)
    in_flight: BTreeMap<u64, (Delivery, Instant)>,
    max_backlog: usize,
    closed: bool,
}

impl Subscriber {
    /// Queue or send one delivery. False when the subscriber is (now) closed.
    fn offer(&mut self, delivery: Delivery) -> bool {
        if self.closed {
            return false;
        }
        if !self.backlog.is_empty() {
            self.push_backlog(delivery);
        } else if let Some(rejected) = self.send_now(delivery) {
            self.push_backlog(rejected);
        }
        !self.closed
    }

    fn push_backlog(&mut self, delivery: Delivery) {
        if self.backlog.len() >= self.max_backlog {
            warn!(
                seq = delivery.seq(),
                backlog = self.backlog.len(),
                "subscriber backlog full, dropping subscriber"
            );
            self.close();
            return;
        }
        self.backlog.push_back(delivery);
    }

    fn close(&mut self) {
        self.closed = true;
        self.backlog.clear();
        self.in_flight.clear();
    }

    /// Hand one delivery to the channel. A full queue gives the delivery back.
    fn send_now(&mut self, delivery: Delivery) -> Option<Delivery> {
        let tracked = self.acked.then(|| delivery.clone());
        match self.tx.try_send(delivery) {
            Ok(()) => {
                if let Some(d) = tracked {
                    self.in_flight.insert(d.seq(), (d, Instant::now()));
                }
                None
            }
            Err(TrySendError::Full(delivery)) => Some(delivery),
            Err(TrySendError::Closed(_)) => {
                self.close();
                None
            }
        }
    }

    fn flush(&mut self) -> usize {
        let mut sent = 0;
        while let Some(delivery) = self.backlog.pop_front() {
            if let Some(rejected) = self.send_now(delivery) {
                self.backlog.push_front(rejected);
                break;
            }
            if self.closed {
                break;
            }
            sent += 1;
        }
        sent
    }
}

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct RouterInner {
    next_seq: AtomicU64,
    next_subscriber: AtomicU64,
    capacity: usize,
    max_backlog: usize,
    lanes: Vec<Mutex<()>>,
    subscribers: RwLock<HashMap<SubscriberId, Shared<Subscriber>>>,
    /// Worker-addressed events no subscription has taken yet, in seq order.
    mailboxes: Mutex<HashMap<WorkerId, VecDeque<Event>>>,
}

/// Coordinator output a worker must not miss just because it connected late.
fn is_worker_addressed(event: &Event) -> bool {
    event.source == EventSource::Coordinator
        && matches!(event.kind, EventKind::Assign | EventKind::Cancel)
        && event.worker_id.is_some()
}

/// Cheap to clone; all clones share the same subscribers.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub published: u64,
    pub subscribers: usize,
    pub backlog: usize,
    pub in_flight: usize,
    /// Events waiting in worker mailboxes.
    pub parked: usize,
}

impl MessageRouter {
    /// `capacity` is the per-subscriber queue depth.
    pub fn new(capacity: usize) -> Self {
        Self::with_backlog_limit(capacity, DEFAULT_MAX_BACKLOG)
    }

    /// Like `new`, with an explicit cap on each backlog and mailbox.
    pub fn with_backlog_limit(capacity: usize, max_backlog: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                next_seq: AtomicU64::new(1),
                next_subscriber: AtomicU64::new(1),
                capacity: capacity.max(1),
                max_backlog: max_backlog.max(1),
                lanes: (0..LANES).map(|_| Mutex::new(())).collect(),
                subscribers: RwLock::new(HashMap::new()),
                mailboxes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.add_subscriber(filter, false)
    }

    /// Deliveries stay in flight until acknowledged and are redelivered otherwise.
    pub fn subscribe_acked(&self, filter: EventFilter) -> Subscription {
        self.add_subscriber(filter, true)
    }

    fn add_subscriber(&self, filter: EventFilter, acked: bool) -> Subscription {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let mut subscriber = Subscriber {
            filter,
            tx,
            backlog: VecDeque::new(),
            acked,
            in_flight: BTreeMap::new(),
            max_backlog: self.inner.max_backlog,
            closed: false,
        };

        // Held until the subscriber is visible so no addressed event slips between.
        let mut mailboxes = lock(&self.inner.mailboxes);
        let mut handed_over = 0;
        if let Some(worker) = subscriber.filter.worker.clone()
            && let Some(parked) = mailboxes.remove(&worker)
        {
            let (wanted, kept): (VecDeque<Event>, VecDeque<Event>) = parked
                .into_iter()
                .partition(|event| subscriber.filter.matches(event));
            for event in wanted {
                subscriber.offer(Delivery { attempt: 1, event });
                handed_over += 1;
            }
            if !kept.is_empty() {
                mailboxes.insert(worker, kept);
            }
        }
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(subscriber)));
        drop(mailboxes);
        debug!(subscriber = id, acked, handed_over, "subscriber added");
        Subscription {
            id,
            rx,
            router: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn lane(&self, task: &TaskId) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        task.hash(&mut hasher);
        &self.inner.lanes[(hasher.finish() as usize) % LANES]
    }

    fn snapshot_subscribers(&self) -> Vec<(SubscriberId, Shared<Subscriber>)> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect()
    }

    /// Stamp `event` with the next sequence number and fan it out. Returns the seq.
    pub fn publish(&self, mut event: Event) -> u64 {
        let _lane = lock(self.lane(&event.task_id));
        let mut mailboxes = is_worker_addressed(&event).then(|| lock(&self.inner.mailboxes));
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        event.seq = seq;

        let mut reached_worker = false;
        let mut dropped = Vec::new();
        let mut subscribers = self.snapshot_subscribers();
        subscribers.sort_by_key(|(id, _)| *id);
        for (id, subscriber) in subscribers {
            let mut subscriber = lock(&subscriber);
            if !subscriber.filter.matches(&event) {
                continue;
            }
            let accepted = subscriber.offer(Delivery {
                attempt: 1,
                event: event.clone(),
            });
            reached_worker |= accepted && subscriber.filter.worker.is_some();
            if subscriber.closed {
                dropped.push(id);
            }
        }

        if let Some(mailboxes) = mailboxes.as_mut()
            && !reached_worker
            && let Some(worker) = event.worker_id.clone()
        {
            let mailbox = mailboxes.entry(worker.clone()).or_default();
            if mailbox.len() >= self.inner.max_backlog {
                warn!(worker_id = %worker, "worker mailbox full, discarding oldest event");
                mailbox.pop_front();
            }
            debug!(seq, worker_id = %worker, kind = %event.kind, "no subscriber yet, parked");
            mailbox.push_back(event.clone());
        }
        drop(mailboxes);

        for id in dropped {
            self.unsubscribe(id);
        }
        trace!(seq, kind = %event.kind, task_id = %event.task_id, "event published");
        seq
    }

    /// Stop tracking `seq` for an acked subscriber. Returns false if it was not in flight.
    pub fn ack(&self, subscriber: SubscriberId, seq: u64) -> bool {
        let Some(entry) = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&subscriber)
            .cloned()
        else {
            return false;
        };
        lock(&entry).in_flight.remove(&seq).is_some()
    }

    /// Push backlogged deliveries into subscriber queues; drop closed subscribers.
    /// Returns the number of deliveries moved.
    pub fn flush(&self) -> usize {
        let mut moved = 0;
        let mut closed = Vec::new();
        for (id, subscriber) in self.snapshot_subscribers() {
            let mut subscriber = lock(&subscriber);
            moved += subscriber.flush();
            if subscriber.closed {
                closed.push(id);
            }
        }
        for id in closed {
            debug!(subscriber = id, "dropping closed subscriber");
            self.unsubscribe(id);
        }
        moved
    }

    /// Re-offer every in-flight delivery older than `after`. Returns how many.
    pub fn redeliver_expired(&self, after: Duration) -> usize {
        let now = Instant::now();
        let mut count = 0;
        for (id, subscriber) in self.snapshot_subscribers() {
            let mut subscriber = lock(&subscriber);
            let expired: Vec<u64> = subscriber
                .in_flight
                .iter()
                .filter(|(_, (_, sent))| now.duration_since(*sent) >= after)
                .map(|(seq, _)| *seq)
                .collect();
            for seq in expired {
                let Some((mut delivery, _)) = subscriber.in_flight.remove(&seq) else {
                    continue;
                };
                delivery.attempt += 1;
                trace!(subscriber = id, seq, attempt = delivery.attempt, "redelivering");
                subscriber.offer(delivery);
                count += 1;
            }
        }
        count
    }

    pub fn stats(&self) -> RouterStats {
        let subscribers = self.snapshot_subscribers();
        let mut stats = RouterStats {
            published: self.inner.next_seq.load(Ordering::Relaxed) - 1,
            subscribers: subscribers.len(),
            ..RouterStats::default()
        };
        for (_, subscriber) in subscribers {
            let subscriber = lock(&subscriber);
            stats.backlog += subscriber.backlog.len();
            stats.in_flight += subscriber.in_flight.len();
        }
        stats.parked = lock(&self.inner.mailboxes).values().map(VecDeque::len).sum();
        stats
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Delivery>,
    router: MessageRouter,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    pub fn ack(&self, seq: u64) -> bool {
        self.router.ack(self.id, seq)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.router.unsubscribe(self.id);
    }
}

/// The worker's side of the router: receives its `assign`/`cancel` events and reports
/// back. The coordinator treats what arrives here like any other worker report.
pub struct WorkerEndpoint {
    worker_id: WorkerId,
    router: MessageRouter,
    subscription: Subscription,
    clock: Arc<dyn Clock>,
}

impl WorkerEndpoint {
    pub fn connect(router: &MessageRouter, worker_id: WorkerId, clock: Arc<dyn Clock>) -> Self {
        let filter = EventFilter::all()
            .kinds([EventKind::Assign, EventKind::Cancel])
            .for_worker(worker_id.clone())
            .excluding_source(EventSource::Worker);
        Self {
            subscription: router.subscribe_acked(filter),
            router: router.clone(),
            worker_id,
            clock,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Next assign/cancel addressed to this worker. Must be acked once handled.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.subscription.recv().await
    }

    pub fn ack(&self, delivery: &Delivery) -> bool {
        self.subscription.ack(delivery.seq())
    }

    pub fn heartbeat(&self, task: &TaskId, assignment: &AssignmentId) -> u64 {
        self.router.publish(Event::heartbeat(
            task.clone(),
            self.worker_id.clone(),
            assignment.clone(),
            self.clock.now(),
        ))
    }

    pub fn progress(
        &self,
        task: &TaskId,
        assignment: &AssignmentId,
        percent: Option<f32>,
        message: Option<String>,
    ) -> u64 {
        self.router.publish(Event::progress(
            task.clone(),
            self.worker_id.clone(),
            assignment.clone(),
            percent,
            message,
            self.clock.now(),
        ))
    }

    pub fn complete(&self, task: &TaskId, assignment: &AssignmentId) -> u64 {
        self.router.publish(Event::completed(
            task.clone(),
            self.worker_id.clone(),
            assignment.clone(),
            self.clock.now(),
        ))
    }

    pub fn fail(&self, task: &TaskId, assignment: &AssignmentId, error: impl Into<String>) -> u64 {
        self.router.publish(Event::failed(
            task.clone(),
            self.worker_id.clone(),
            assignment.clone(),
            error,
            self.clock.now(),
        ))
    }
}
