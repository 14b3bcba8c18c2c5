mod command;
mod tick;
mod time;

pub use command::{CommandBuffer, UserCommand, read_commands};
pub use tick::TickScheduler;
pub use time::GameTime;
