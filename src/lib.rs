//! Library entrypoint for settlement-probe.
//!
//! Exposes all modules so integration tests can import them.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod consistency;
pub mod data;
pub mod error;
pub mod load;
pub mod settlement;
