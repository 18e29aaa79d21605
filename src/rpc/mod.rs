//! Agent RPC modules.
//!
//! - `proto`: command table and MessagePack wire types.
//! - `codec`: frame decoder and request encoder.
//! - `transport`: TCP connection split into framed reader and writer.
//! - `client`: session state machine, sequencing and request correlation.
//! - `dispatch`: the connection's single reader task and its routes.
//! - `subscription`: `stream`, `monitor`, `query` and `stop`.
//! - `commands`: typed request/reply commands.

/// Frame decoder and request encoder.
pub mod codec;
/// Typed request/reply commands on `RpcClient`.
pub mod commands;
/// Session handle, options and errors.
pub mod client;
mod dispatch;
/// Command table and wire messages.
pub mod proto;
/// Streaming subscriptions.
pub mod subscription;
/// TCP transport halves.
pub mod transport;

pub use client::{
    ConnectOptions, Response, RpcClient, RpcClientDefaults, RpcClientError, SessionState,
    DEFAULT_RPC_HOST, DEFAULT_RPC_PORT,
};
pub use subscription::{Subscription, SubscriptionState};
