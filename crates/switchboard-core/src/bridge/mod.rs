pub mod bridge;

pub use bridge::{Bridge, Emitter};
