//! Core translation engine module

pub mod circuit_breaker;
pub mod client;
pub mod clock;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod reservoir;
pub mod retry;
pub mod scripted;
pub mod selector;
pub mod store;
