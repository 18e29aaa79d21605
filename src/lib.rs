//! Async Rust client for the Serf agent RPC protocol.
//!
//! The crate is organized by surface:
//! - `rpc`: MessagePack-over-TCP session with the local agent: handshake and
//!   auth, request/reply commands, and streaming subscriptions.
//! - `handler`: helpers for programs the agent runs as event handlers.
//! - `job`: detached background jobs that record their state in a file
//!   (unix only).

/// Event-handler adapter for agent-invoked scripts.
pub mod handler;
/// Detached job supervisor with a JSON state file.
#[cfg(unix)]
pub mod job;
/// Agent RPC client, protocol types, and subscriptions.
pub mod rpc;

pub use rpc::{ConnectOptions, RpcClient, RpcClientError};
