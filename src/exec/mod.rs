// src/exec/mod.rs

//! Dispatch layer.
//!
//! This module moves task requests from the engine to ants and responses
//! back, and hosts the embedded ant used to run jobs locally.
//!
//! - [`backend`] provides the `DispatchBackend` trait the runtime talks to
//!   and `QueueDispatchBackend`, which seals requests and publishes them.
//! - [`transport`] is the topic abstraction plus the in-process
//!   `ChannelTransport` and the pumps feeding responses and heartbeats into
//!   the runtime.
//! - [`local_ant`] runs SHELL requests with `tokio::process`.

pub mod backend;
pub mod local_ant;
pub mod transport;

pub use backend::{DispatchBackend, QueueDispatchBackend};
pub use local_ant::LocalAnt;
pub use transport::{
    spawn_registration_pump, spawn_response_pump, ChannelTransport, Message, Transport,
};
