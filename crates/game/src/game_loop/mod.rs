mod client;
mod server;
mod state_machine;

pub use client::{ClientGame, ClientGameLoop, ClientState};
pub use server::{ServerGame, ServerGameLoop, ServerState};
pub use state_machine::{StateHook, StateMachine, StateUpdate};
