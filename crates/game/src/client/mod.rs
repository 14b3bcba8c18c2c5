mod network;
mod time;

pub use network::{ClientConnectionState, ClientPackageInfo, NetworkClient};
pub use time::{ClientTimeline, TimeSync, TimelineCounters};
