//! HTTP API modules.
//!
//! - `client`: request descriptors and the rate-limited dispatcher.
//! - `ratelimit`: per-route buckets, route normalization and 429 parsing.

/// Request dispatcher and its error type.
pub mod client;
/// Rate limit bucket store.
pub mod ratelimit;
