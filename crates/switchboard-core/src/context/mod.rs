pub mod manager;
pub mod message;

pub use manager::ContextManager;
pub use message::{ContextMessage, ContextRole};
