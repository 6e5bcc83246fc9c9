//! Message bus for agent-to-agent communication

pub mod queue;

pub use queue::{BusStats, BusStatus, DEFAULT_HISTORY_LIMIT, MessageBus, Subscriber, SubscriptionId};
