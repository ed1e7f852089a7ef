//! Controller internals, exposed as a library so integration tests can
//! drive the real services without a network.

pub mod admin;
pub mod config;
pub mod grpc;
pub mod hub;
pub mod state;
