// src/lib.rs
pub mod config;
pub mod metrics;
pub mod server;
pub mod shutdown;
