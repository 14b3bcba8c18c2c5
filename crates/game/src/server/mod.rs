mod connection;
mod network;

pub use connection::{OutgoingWorld, ServerConnection, ServerPackageInfo};
pub use network::{NetworkServer, ServerEvent};
