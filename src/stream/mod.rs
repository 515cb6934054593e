//! Realtime gateway modules.
//!
//! - `client`: connection manager owning the socket and reconnect cadence.
//! - `outbound`: message ids, envelope building, and delivery routing.
//! - `proto`: wire types shared with the gateway.
//! - `recent`: bounded record of recent events and diagnostics.

/// Connection manager, lifecycle hooks, and control handle.
pub mod client;
/// Outbound dispatch and delivery routing.
pub mod outbound;
/// Gateway wire types.
pub mod proto;
/// Recent-activity ring buffer.
pub mod recent;
