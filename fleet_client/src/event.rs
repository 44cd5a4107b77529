//! Public events emitted by a running [`crate::Client`].

use crate::console::ConsoleConnection;

/// Top-level lifecycle event surfaced to the host application.
#[derive(Debug)]
pub enum Event {
    /// The client finished its initial bootstrap: authenticated,
    /// opened its account WebSocket(s), and joined every group allowed
    /// by the configured allow/deny lists.
    Ready,
    /// A console connection to a game server came online and is ready
    /// to accept commands.
    Connect(ConsoleConnection),
}
