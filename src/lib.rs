//! Transport layer for a realtime chat gateway and its HTTP API.
//!
//! The crate is organized by transport surface:
//! - `gateway`: websocket session engine with heartbeats, resume and reconnect.
//! - `rest`: HTTP dispatcher that honours per-route and global rate limits.
//! - `retry`: shared backoff and timeout utilities.

/// Realtime gateway client, protocol types and session helpers.
pub mod gateway;
/// HTTP API client and rate limit buckets.
pub mod rest;
/// Backoff and timeout helpers shared by both transports.
pub mod retry;

pub use gateway::client::{
    GatewayClient, GatewayConnection, GatewayError, GatewayEvent, GatewayOptions, GatewaySender,
};
pub use gateway::proto::{Envelope, Opcode};
pub use rest::client::{RequestDescriptor, RestClient, RestClientOptions, RestError};
