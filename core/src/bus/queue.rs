//! In-process message bus with per-agent inboxes

use crate::error::Result;
use crate::messages::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

/// Default number of messages kept in the bus history
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Identifier returned by [`MessageBus::subscribe`]
pub type SubscriptionId = u64;

/// Callback invoked for every message sent to a subscribed agent
pub type Subscriber = Arc<
    dyn Fn(Message) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// FIFO inbox for a single recipient
#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Inbox {
    async fn push(&self, message: Message) {
        self.queue.lock().await.push_back(message);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Message> {
        self.queue.lock().await.pop_front()
    }

    async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub active_queues: usize,
}

/// Bus status report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStatus {
    pub running: bool,
    pub subscribers: HashMap<String, usize>,
    pub active_queues: usize,
    pub history_size: usize,
    pub history_limit: usize,
    pub stats: BusStats,
}

/// Message bus that routes messages between named agents.
///
/// Every subscribed agent owns an inbox. [`send`](Self::send) appends to the
/// recipient's inbox in call order and then notifies the recipient's
/// subscriber callbacks on spawned tasks, so a slow callback never holds up
/// the sender.
#[derive(Clone)]
pub struct MessageBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<(SubscriptionId, Subscriber)>>>>,
    inboxes: Arc<RwLock<HashMap<String, Arc<Inbox>>>>,
    history: Arc<RwLock<VecDeque<Message>>>,
    history_limit: usize,
    running: Arc<RwLock<bool>>,
    next_subscription: Arc<AtomicU64>,
    counters: Arc<Counters>,
    active_queues: Arc<AtomicUsize>,
}

impl MessageBus {
    /// Create a new message bus
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a bus that keeps at most `history_limit` messages of history
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            history_limit: history_limit.max(1),
            running: Arc::new(RwLock::new(false)),
            next_subscription: Arc::new(AtomicU64::new(1)),
            counters: Arc::new(Counters::default()),
            active_queues: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start accepting messages
    pub async fn start(&self) {
        *self.running.write().await = true;
        info!("Message bus started");
    }

    /// Stop accepting messages and drop every pending inbox
    pub async fn stop(&self) {
        *self.running.write().await = false;

        let mut inboxes = self.inboxes.write().await;
        for (name, inbox) in inboxes.iter() {
            let pending = inbox.len().await;
            if pending > 0 {
                warn!("Dropping {} pending message(s) for {}", pending, name);
            }
        }
        inboxes.clear();
        self.active_queues.store(0, Ordering::Relaxed);

        info!("Message bus stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Subscribe a callback for messages addressed to `agent_name`
    pub async fn subscribe<F, Fut>(&self, agent_name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let agent_name = agent_name.into();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscriber: Subscriber = Arc::new(move |msg| Box::pin(callback(msg)));

        self.subscribers
            .write()
            .await
            .entry(agent_name.clone())
            .or_default()
            .push((id, subscriber));
        self.ensure_inbox(&agent_name).await;

        debug!("Subscribed {} (subscription {})", agent_name, id);
        id
    }

    /// Remove a subscription. The inbox goes away with the last subscriber.
    pub async fn unsubscribe(&self, agent_name: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(list) = subscribers.get_mut(agent_name) else {
            return false;
        };

        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;

        if list.is_empty() {
            subscribers.remove(agent_name);
            if self.inboxes.write().await.remove(agent_name).is_some() {
                self.active_queues.fetch_sub(1, Ordering::Relaxed);
            }
        }

        if removed {
            debug!("Unsubscribed {} (subscription {})", agent_name, id);
        }
        removed
    }

    pub async fn subscriber_count(&self, agent_name: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(agent_name)
            .map_or(0, Vec::len)
    }

    /// Send a message to its recipient.
    ///
    /// Returns `false` when the bus is stopped or nobody is subscribed under
    /// the recipient's name. Routing misses still land in the history.
    pub async fn send(&self, message: Message) -> bool {
        if !*self.running.read().await {
            debug!("Bus stopped, dropping {} to {}", message.kind(), message.recipient());
            return false;
        }

        self.record(&message).await;

        let callbacks: Vec<Subscriber> = match self.subscribers.read().await.get(message.recipient()) {
            Some(list) if !list.is_empty() => list.iter().map(|(_, cb)| cb.clone()).collect(),
            _ => {
                warn!("No subscribers for recipient: {}", message.recipient());
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };

        let inbox = self.ensure_inbox(message.recipient()).await;
        inbox.push(message.clone()).await;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Sent {} from {} to {} ({})",
            message.kind(),
            message.sender(),
            message.recipient(),
            message.message_id()
        );

        for callback in callbacks {
            let msg = message.clone();
            let counters = Arc::clone(&self.counters);
            tokio::spawn(async move {
                let recipient = msg.recipient().to_string();
                if let Err(e) = callback(msg).await {
                    error!("Subscriber for {} failed: {}", recipient, e);
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        true
    }

    /// Send a copy of `message` to every subscriber not listed in `exclude`.
    ///
    /// Each copy gets its own message id; the correlation id is shared.
    pub async fn broadcast(&self, message: &Message, exclude: &[&str]) -> usize {
        let recipients: Vec<String> = self
            .subscribers
            .read()
            .await
            .keys()
            .filter(|name| !exclude.contains(&name.as_str()))
            .cloned()
            .collect();

        let mut delivered = 0;
        for recipient in recipients {
            if self.send(message.redirect(recipient)).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Take the next message from an agent's inbox, waiting up to `timeout`
    pub async fn receive(&self, agent_name: &str, timeout: Duration) -> Option<Message> {
        let inbox = self.inboxes.read().await.get(agent_name).cloned();
        let Some(inbox) = inbox else {
            tokio::time::sleep(timeout).await;
            return None;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(message) = inbox.pop().await {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, inbox.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Number of messages waiting in an agent's inbox
    pub async fn queue_len(&self, agent_name: &str) -> usize {
        let inbox = self.inboxes.read().await.get(agent_name).cloned();
        match inbox {
            Some(inbox) => inbox.len().await,
            None => 0,
        }
    }

    /// Recent messages, oldest first, optionally filtered by session and agent
    pub async fn history(
        &self,
        session_id: Option<&str>,
        agent_name: Option<&str>,
        limit: usize,
    ) -> Vec<Message> {
        let history = self.history.read().await;
        let mut matched: Vec<Message> = history
            .iter()
            .rev()
            .filter(|m| session_id.is_none_or(|s| m.session_id() == Some(s)))
            .filter(|m| agent_name.is_none_or(|a| m.involves(a)))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            active_queues: self.active_queues.load(Ordering::Relaxed),
        }
    }

    pub async fn status(&self) -> BusStatus {
        let subscribers = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(name, list)| (name.clone(), list.len()))
            .collect();

        BusStatus {
            running: self.is_running().await,
            subscribers,
            active_queues: self.inboxes.read().await.len(),
            history_size: self.history.read().await.len(),
            history_limit: self.history_limit,
            stats: self.stats(),
        }
    }

    async fn record(&self, message: &Message) {
        let mut history = self.history.write().await;
        if history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(message.clone());
    }

    async fn ensure_inbox(&self, agent_name: &str) -> Arc<Inbox> {
        if let Some(inbox) = self.inboxes.read().await.get(agent_name) {
            return Arc::clone(inbox);
        }

        let mut inboxes = self.inboxes.write().await;
        let inbox = inboxes.entry(agent_name.to_string()).or_insert_with(|| {
            self.active_queues.fetch_add(1, Ordering::Relaxed);
            Arc::new(Inbox::default())
        });
        Arc::clone(inbox)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
