//! Relay daemon library: environment configuration and component wiring.
//!
//! The binary in `main.rs` is a thin shell over [`config::RelayConfig`] and
//! [`wiring::run`]; keeping the wiring in the library lets black-box tests
//! drive the same code paths with in-memory components.

pub mod config;
pub mod wiring;
