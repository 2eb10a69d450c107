//! Tunerflow - live TV tuner sharing and progressive HTTP streaming
//!
//! This library crate exposes the core functionality for integration testing.

pub mod config;
pub mod live;
pub mod server;
pub mod streaming;
pub mod transcode;
pub mod tuners;
