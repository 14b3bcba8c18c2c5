mod queue;
mod types;

pub use queue::{EventQueue, MAX_EVENTS_PER_PACKAGE};
pub use types::{NetworkEvent, ReliabilityMode, read_events, write_events};
