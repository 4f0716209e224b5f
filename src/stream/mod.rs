//! Realtime stream modules.
//!
//! - `client`: reconnect supervisor, outbound sinks, and cancellation.
//! - `proto`: wire types and server-push framing.
//! - `session`: one streaming connection lifecycle.

/// Stream client, reconnect supervisor, and handles.
pub mod client;
/// Wire types and framing parser.
pub mod proto;
/// Single-session connect and read loop.
pub(crate) mod session;
