pub mod config;
pub mod events;
pub mod types;

pub use config::Config;
pub use events::{Event, EventPayload, EventType};
pub use types::*;
