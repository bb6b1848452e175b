pub mod manager;
pub mod message;

pub use manager::{ThreadManager, ThreadSearchHit, ThreadSummary};
pub use message::{HistoryMessage, MessageKind, MessageRole};
