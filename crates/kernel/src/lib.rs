//! Plugin host kernel.
//!
//! This library exposes the host for embedding and integration testing.
//! The `plughost` binary wraps it in a small command line tool.

pub mod config;
pub mod fetch;
pub mod host;
pub mod plugin;
pub mod sandbox;
pub mod service;
pub mod store;
