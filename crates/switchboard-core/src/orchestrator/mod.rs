pub mod events;
pub mod orchestrator;

pub use events::{TurnEvent, TurnRequest};
pub use orchestrator::TurnOrchestrator;
