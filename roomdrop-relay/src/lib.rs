//! Roomdrop relay: rendezvous rooms and blind forwarding of signaling envelopes.

pub mod config;
pub mod server;

pub use config::Config;
pub use server::{app, serve};
