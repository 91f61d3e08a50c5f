//! The inter-agent message bus.
//!
//! Publishers enqueue; a periodic processing tick drains the queue and fans
//! each message out to matching subscribers. Publishing therefore never
//! waits on subscriber code.
//!
//! Routing:
//! - `MessageTarget::Broadcast` reaches every subscriber of the topic.
//! - `MessageTarget::Agent(id)` reaches only subscribers registered under
//!   `id` with `subscribe_as`.
//!
//! Stopping the bus halts the tick and discards everything still queued.
//! Publishing or subscribing on a stopped bus is logged and dropped, never
//! raised to the caller.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use warden_contracts::{
    agent::AgentId,
    error::WardenError,
    message::{Message, MessageTarget},
};

use crate::{timer::ScheduledTask, traits::MessageHandler};

/// Bus tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Delay between processing ticks.
    pub processing_interval_ms: u64,
    /// Messages held between ticks before new publishes are dropped.
    pub max_queue_len: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            processing_interval_ms: 50,
            max_queue_len: 10_000,
        }
    }
}

/// Counters since the bus was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    /// Individual handler invocations.
    pub delivered: u64,
    /// Messages refused (stopped bus, full queue) or discarded on stop.
    pub dropped: u64,
    pub subscribers: usize,
    pub queued: usize,
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    owner: Option<AgentId>,
    handler: Arc<dyn MessageHandler>,
}

impl Subscriber {
    fn accepts(&self, target: &MessageTarget) -> bool {
        match target {
            MessageTarget::Broadcast => true,
            MessageTarget::Agent(id) => self.owner.as_ref() == Some(id),
        }
    }
}

struct BusShared {
    config: BusConfig,
    queue: Mutex<VecDeque<Message>>,
    /// topic → subscribers, in registration order.
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_subscriber_id: AtomicU64,
    accepting: AtomicBool,
    ticker: Mutex<Option<ScheduledTask>>,
    /// Held from batch drain to the end of fan-out, so two delivery passes
    /// never interleave.
    delivery: Mutex<()>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BusShared {
    fn remove_subscriber(&self, topic: &str, id: u64) -> bool {
        let mut table = self.subscribers.write().expect("bus subscriber lock poisoned");
        let Some(list) = table.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            table.remove(topic);
        }
        removed
    }
}

/// A cheap-to-clone handle to one bus. All clones share queue, subscribers
/// and tick.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
}

impl MessageBus {
    /// Create a bus that accepts messages but has no processing tick yet.
    ///
    /// Call `start_processing` (or use `MessageBus::start`) to deliver on a
    /// timer, or drive delivery by hand with `process_pending`.
    pub fn new(config: BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                config,
                queue: Mutex::new(VecDeque::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                ticker: Mutex::new(None),
                delivery: Mutex::new(()),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Create a bus and start its processing tick. Requires a tokio runtime.
    pub fn start(config: BusConfig) -> Self {
        let bus = Self::new(config);
        bus.start_processing();
        bus
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// (Re)start the processing tick and accept publishes again.
    ///
    /// Calling this while already ticking is a no-op.
    pub fn start_processing(&self) {
        let mut ticker = self.shared.ticker.lock().expect("bus ticker lock poisoned");
        self.shared.accepting.store(true, Ordering::Release);
        if ticker.is_some() {
            return;
        }

        let weak: Weak<BusShared> = Arc::downgrade(&self.shared);
        let period = Duration::from_millis(self.shared.config.processing_interval_ms);
        *ticker = Some(ScheduledTask::every("message-bus", period, move || {
            if let Some(shared) = weak.upgrade() {
                MessageBus { shared }.process_pending();
            }
        }));

        info!(
            processing_interval_ms = self.shared.config.processing_interval_ms,
            "message bus started"
        );
    }

    /// Halt the tick and discard queued messages.
    ///
    /// Subscriptions survive, so the bus can be restarted; messages do not.
    pub fn stop(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        if let Some(ticker) = self
            .shared
            .ticker
            .lock()
            .expect("bus ticker lock poisoned")
            .take()
        {
            ticker.cancel();
        }

        let discarded = {
            let mut queue = self.shared.queue.lock().expect("bus queue lock poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        self.shared
            .dropped
            .fetch_add(discarded as u64, Ordering::Relaxed);

        info!(discarded, "message bus stopped");
    }

    /// True while publishes are accepted.
    pub fn is_running(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Enqueue `message` for the next tick.
    ///
    /// Returns false when the message was dropped because the bus is stopped
    /// or its queue is full.
    pub fn publish(&self, message: Message) -> bool {
        if !self.is_running() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            let err = WardenError::BusUnavailable {
                reason: "publish after stop".to_string(),
            };
            warn!(
                topic = %message.topic,
                sender = %message.sender_id,
                error = %err,
                "message dropped"
            );
            return false;
        }

        let mut queue = self.shared.queue.lock().expect("bus queue lock poisoned");
        // Re-checked under the queue lock so a concurrent stop() cannot leave
        // this message behind in a cleared queue.
        if !self.is_running() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if queue.len() >= self.shared.config.max_queue_len {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                topic = %message.topic,
                max_queue_len = self.shared.config.max_queue_len,
                "message bus queue full, message dropped"
            );
            return false;
        }

        debug!(
            topic = %message.topic,
            target = %message.target,
            sender = %message.sender_id,
            "message queued"
        );
        queue.push_back(message);
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Build and publish a message in one call.
    pub fn send(
        &self,
        sender_id: AgentId,
        target: impl Into<MessageTarget>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> bool {
        self.publish(Message::new(sender_id, target, topic, payload))
    }

    /// Subscribe anonymously: receives broadcasts on `topic` only.
    pub fn subscribe<H>(&self, topic: impl Into<String>, handler: H) -> Subscription
    where
        H: MessageHandler + 'static,
    {
        self.register(None, topic.into(), Arc::new(handler))
    }

    /// Subscribe under `agent_id`: receives broadcasts on `topic` and
    /// messages on `topic` addressed to `agent_id`.
    pub fn subscribe_as<H>(
        &self,
        agent_id: AgentId,
        topic: impl Into<String>,
        handler: H,
    ) -> Subscription
    where
        H: MessageHandler + 'static,
    {
        self.register(Some(agent_id), topic.into(), Arc::new(handler))
    }

    pub(crate) fn register(
        &self,
        owner: Option<AgentId>,
        topic: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Subscription {
        if !self.is_running() {
            let err = WardenError::BusUnavailable {
                reason: "subscribe after stop".to_string(),
            };
            warn!(topic = %topic, error = %err, "subscription refused");
            return Subscription::inert(topic);
        }

        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .write()
            .expect("bus subscriber lock poisoned")
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, owner, handler });

        debug!(topic = %topic, subscriber = id, "subscriber registered");

        Subscription {
            id,
            topic,
            bus: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        }
    }

    /// Deliver every message queued right now. Returns the number of handler
    /// invocations.
    ///
    /// Messages are taken from the queue in one batch and delivered in
    /// publish order. The subscriber list is snapshotted per message, so
    /// (un)subscribing from inside a handler or from another thread is safe.
    ///
    /// Concurrent calls (a manual call racing the tick) take turns, so a later
    /// batch is never delivered ahead of an earlier one. Handlers must not
    /// call this themselves.
    pub fn process_pending(&self) -> usize {
        let _delivering = self
            .shared
            .delivery
            .lock()
            .expect("bus delivery lock poisoned");
        let batch: Vec<Message> = {
            let mut queue = self.shared.queue.lock().expect("bus queue lock poisoned");
            queue.drain(..).collect()
        };

        let mut invocations = 0;
        for message in &batch {
            let recipients: Vec<Subscriber> = {
                let table = self
                    .shared
                    .subscribers
                    .read()
                    .expect("bus subscriber lock poisoned");
                table
                    .get(&message.topic)
                    .map(|list| {
                        list.iter()
                            .filter(|s| s.accepts(&message.target))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default()
            };

            if recipients.is_empty() {
                debug!(topic = %message.topic, target = %message.target, "no recipients");
            }

            for subscriber in recipients {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| subscriber.handler.handle(message)));
                if outcome.is_err() {
                    warn!(
                        topic = %message.topic,
                        subscriber = subscriber.id,
                        "subscriber panicked while handling message"
                    );
                    continue;
                }
                invocations += 1;
            }
        }

        self.shared
            .delivered
            .fetch_add(invocations as u64, Ordering::Relaxed);
        invocations
    }

    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().expect("bus queue lock poisoned").len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .expect("bus subscriber lock poisoned")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            queued: self.queued_len(),
        }
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Handle returned by `subscribe`. Dropping it does not unsubscribe; call
/// `unsubscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: String,
    bus: Weak<BusShared>,
    active: AtomicBool,
}

impl Subscription {
    fn inert(topic: String) -> Self {
        Self {
            id: 0,
            topic,
            bus: Weak::new(),
            active: AtomicBool::new(false),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the subscriber. Returns true the first time it takes effect.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.bus.upgrade() {
            Some(shared) => shared.remove_subscriber(&self.topic, self.id),
            None => false,
        }
    }
}
