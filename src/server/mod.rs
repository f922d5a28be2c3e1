//! Consumer-facing WebSocket server.
//!
//! Consumers send JSON requests (`{"id": 1, "command": "setFan", "value": 40}`)
//! and receive a response carrying the same `id`, plus a push message for
//! every state update from the roaster.

pub mod handler;
pub mod messages;
pub mod websocket;

pub use handler::CommandHandler;
pub use messages::{Push, PushData, ReadingData, Request, Response, ResponseStatus};
pub use websocket::WebSocketServer;
