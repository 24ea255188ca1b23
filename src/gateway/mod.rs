//! Realtime gateway modules.
//!
//! - `client`: websocket transport and the session engine worker.
//! - `proto`: opcode table, envelope codec and handshake payloads.
//! - `session`: session continuity state and connection lifecycle.
//! - `heartbeat`: heartbeat timer with ack tracking.
//! - `reconnect`: pacing of reconnect attempts.

/// Websocket connection, session engine and frame sender.
pub mod client;
/// Heartbeat scheduling.
pub mod heartbeat;
/// Gateway protocol envelope and opcodes.
pub mod proto;
/// Reconnect supervision.
pub mod reconnect;
/// Session state owned by the engine.
pub mod session;
