//! Rust client SDK for the mcpproxy control plane.
//!
//! The crate is organized by transport surface:
//! - `api`: REST client with per-category failure classification and retry.
//! - `stream`: realtime status stream with supervised reconnection.
//! - `retry`: backoff policies shared by both retry loops.
//! - `tls`: shared HTTP transport construction with local CA trust.

/// REST API client, response envelope, and typed payloads.
pub mod api;
/// Backoff policies and the retry driver.
pub mod retry;
/// Realtime status stream client, wire types, and session handling.
pub mod stream;
/// HTTP transport construction with local CA trust.
pub mod tls;
