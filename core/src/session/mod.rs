//! Per-conversation state shared between agents

pub mod state;
pub mod store;

pub use state::{ChatTurn, Intake, MAX_FORTUNE_HISTORY, Reading, SessionState, SessionUpdate};
pub use store::{SessionStore, SessionSummary, StoreStats, StoreStatus, SweepReport};
